// Agent configuration, loaded from a JSON file next to the binary.

use crate::error::AgentError;
use secmon_core::FAILED_LOGON_EVENT_ID;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Agent configuration file contents.
///
/// Unknown keys are ignored so newer config files keep working with
/// older agents.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Unique identifier for this host across the fleet.
    pub host_id: String,
    /// Collector ingest endpoint, e.g. `https://collector:3000/api/v1/events`.
    pub collector_url: String,
    /// Subscription wait timeout and retry cadence, in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    /// Event ID to capture. Defaults to the failed-logon code.
    #[serde(default = "default_event_id")]
    pub event_id: u32,
}

fn default_poll_interval() -> u64 {
    10
}

fn default_event_id() -> u32 {
    FAILED_LOGON_EVENT_ID
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self, AgentError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AgentError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: AgentConfig = serde_json::from_str(&content)
            .map_err(|e| AgentError::Config(format!("invalid {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AgentError> {
        if self.host_id.trim().is_empty() {
            return Err(AgentError::Config("host_id must not be empty".into()));
        }
        if self.collector_url.trim().is_empty() {
            return Err(AgentError::Config("collector_url must not be empty".into()));
        }
        if self.poll_interval == 0 {
            return Err(AgentError::Config("poll_interval must be at least 1".into()));
        }
        Ok(())
    }

    /// Path of the persisted dedup fingerprint set for this host.
    pub fn seen_path(&self) -> PathBuf {
        PathBuf::from(format!("{}_seen.json", self.host_id))
    }
}
