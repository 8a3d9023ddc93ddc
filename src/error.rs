//! Error types for the stream health core
//!
//! Ingestion-path errors (`Decode`, `Internal`) are contained: logged and
//! skipped, never surfaced to callers. Query-path errors (`EventNotFound`,
//! `StreamNotFound`) are surfaced. `Transport` triggers reconnection and is
//! only surfaced once the backoff budget is exhausted.

use thiserror::Error;

/// Result type for stream health operations
pub type Result<T> = std::result::Result<T, HealthError>;

#[derive(Debug, Error)]
pub enum HealthError {
    /// Replay cursor cannot be located in retained history
    #[error("event not found in retained history")]
    EventNotFound,

    /// Manifest has no record
    #[error("no health record for stream {0}")]
    StreamNotFound(String),

    /// Malformed broker message
    #[error("failed to decode event: {0}")]
    Decode(#[from] serde_json::Error),

    /// Broker connection failure
    #[error("broker transport error: {0}")]
    Transport(String),

    /// Owner context cancelled; not a failure
    #[error("operation cancelled")]
    Cancelled,

    /// Invariant violation on the ingestion path
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<lapin::Error> for HealthError {
    fn from(err: lapin::Error) -> Self {
        HealthError::Transport(err.to_string())
    }
}

impl HealthError {
    /// Whether the error should terminate the consume loop or be skipped
    pub fn is_fatal(&self) -> bool {
        matches!(self, HealthError::Transport(_))
    }
}
