//! Shared types for the failed-login telemetry pipeline.
//!
//! Everything the agent puts on the wire and the collector reads back
//! lives here, so the two sides cannot drift apart.

pub mod event;
pub mod fingerprint;
pub mod ip_filter;
pub mod timestamp;

pub use event::{EventBatch, FailedLoginEvent, FAILED_LOGON_EVENT_ID};
pub use fingerprint::event_fingerprint;
pub use ip_filter::{is_ignored_source, is_valid_ip};
pub use timestamp::utc_to_local;
