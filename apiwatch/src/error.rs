use thiserror::Error;

/// Failures while refreshing remotely-managed configuration. These are
/// always logged and swallowed: the caches keep serving the last good
/// snapshot and retry on the next change-token notification.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config fetch failed: {0}")]
    Fetch(String),
    #[error("config payload malformed: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("event rejected by delivery queue: {0}")]
    Rejected(String),
    #[error("transient delivery error, event dropped: {0}")]
    Retryable(String),
}
