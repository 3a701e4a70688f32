// Wire types shared between the Windows agent and the collector.

use serde::{Deserialize, Serialize};

/// Windows Security log event ID for a failed logon.
pub const FAILED_LOGON_EVENT_ID: u32 = 4625;

/// One authentication-failure event as shipped by an agent.
///
/// Field values are carried exactly as parsed from the event XML; the
/// collector is responsible for coercing numeric-looking fields. The
/// NTSTATUS `status` field in particular MUST stay a string — values
/// like `0xC000006A` do not fit a signed 32-bit integer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedLoginEvent {
    /// Host-local civil time, fractional seconds preserved as rendered
    /// by the event log (up to 7 digits).
    pub timestamp: String,
    pub ip_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logon_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workstation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_port: Option<String>,
}

/// A batch of events posted to the collector ingest endpoint.
///
/// `host_id` and `host_name` are supplied once per batch rather than
/// per event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBatch {
    pub host_id: String,
    pub host_name: String,
    pub events: Vec<FailedLoginEvent>,
}
