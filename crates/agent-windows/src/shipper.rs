// HTTP delivery to the collector.

use secmon_core::{EventBatch, FailedLoginEvent};
use std::time::Duration;

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Shipper {
    client: reqwest::blocking::Client,
    collector_url: String,
    host_id: String,
    host_name: String,
}

impl Shipper {
    pub fn new(
        collector_url: &str,
        host_id: &str,
        host_name: &str,
    ) -> Result<Self, reqwest::Error> {
        // Collectors inside the perimeter commonly run with self-signed
        // TLS certs; transport trust is out of scope here.
        let client = reqwest::blocking::Client::builder()
            .timeout(RESPONSE_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()?;

        Ok(Self {
            client,
            collector_url: collector_url.to_string(),
            host_id: host_id.to_string(),
            host_name: host_name.to_string(),
        })
    }

    /// Send one batch. Returns true only on HTTP 2xx; all failures are
    /// logged and absorbed — the caller keeps the events queued.
    pub fn send(&self, events: &[FailedLoginEvent]) -> bool {
        let batch = EventBatch {
            host_id: self.host_id.clone(),
            host_name: self.host_name.clone(),
            events: events.to_vec(),
        };

        match self.client.post(&self.collector_url).json(&batch).send() {
            Ok(response) if response.status().is_success() => {
                tracing::info!(count = events.len(), "sent events to collector");
                true
            }
            Ok(response) => {
                tracing::error!(status = %response.status(), "collector rejected batch");
                false
            }
            Err(e) => {
                tracing::error!("failed to reach collector: {}", e);
                false
            }
        }
    }
}
