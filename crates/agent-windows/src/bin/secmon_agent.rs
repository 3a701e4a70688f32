//! secmon-agent binary entry point.
//!
//! Watches the Windows Security log for failed logons and ships them
//! to the collector. Requires Windows; on other platforms it exits
//! with an error.

use secmon_agent_windows::AgentConfig;
use std::path::PathBuf;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "secmon_agent=info,secmon_agent_windows=info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let config_path = args
        .iter()
        .position(|a| a == "--config" || a == "-c")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.json"));

    let config = match AgentConfig::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("cannot start: {}", e);
            std::process::exit(1);
        }
    };

    #[cfg(not(target_os = "windows"))]
    {
        let _ = config;
        tracing::error!("secmon-agent requires Windows (Security event log access)");
        std::process::exit(1);
    }

    #[cfg(target_os = "windows")]
    {
        use secmon_agent_windows::SecurityEventAgent;
        use std::sync::atomic::Ordering;

        let mut agent = match SecurityEventAgent::new(config) {
            Ok(a) => a,
            Err(e) => {
                tracing::error!("cannot start: {}", e);
                std::process::exit(1);
            }
        };

        let shutdown = agent.shutdown_flag();
        ctrlc::set_handler(move || {
            tracing::info!("shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        })
        .expect("failed to install shutdown handler");

        if let Err(e) = agent.run() {
            tracing::error!("agent terminated: {}", e);
            std::process::exit(1);
        }
    }
}
