use thiserror::Error;

/// Agent-side error taxonomy. Only `Config` is fatal; everything else
/// is absorbed by the main loop and logged.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("event log subscription failed: {0}")]
    Subscription(String),

    #[error("event log query failed: {0}")]
    Query(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}
