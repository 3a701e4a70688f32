// secmon-server main.rs
// Central collector: ingest API, detection, block manager, live feed.

use secmon_server::api::{self, AppState};
use secmon_server::blocklist::{self, LogFirewall};
use secmon_server::db::Database;
use secmon_server::settings::Settings;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Expired blocks are cleaned up within one interval of their deadline.
const RECONCILER_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "secmon_server=info".into()),
        )
        .init();

    let port: u16 = std::env::var("API_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(3000);
    let base_path = std::env::var("API_BASE_PATH").unwrap_or_else(|_| "/api/v1".to_string());
    let db_path = std::env::var("DB_DSN")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("secmon.db"));

    tracing::info!("database: {}", db_path.display());
    tracing::info!("port: {}", port);

    let db = Arc::new(Database::open(&db_path).expect("failed to open database"));
    let settings = Settings::load(&db);
    tracing::info!(
        threshold = settings.threshold,
        window_minutes = settings.time_window_minutes,
        auto_block = settings.auto_block_enabled,
        "policy loaded"
    );

    let firewall = Arc::new(LogFirewall);
    let state = AppState::new(db, settings, firewall);

    // Background expiry reconciler shares the API's block manager and
    // firewall adapter.
    tokio::spawn(blocklist::run_reconciler(
        state.blocks.clone(),
        RECONCILER_INTERVAL,
    ));

    let app = api::router(state, &base_path);

    let addr = format!("0.0.0.0:{}", port);
    tracing::info!("secmon collector listening at http://{}{}", addr, base_path);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind API port");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl+c");
    tracing::info!("shutting down...");
}
