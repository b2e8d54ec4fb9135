//! Protocol-level errors shared by sinks.

use thiserror::Error;

/// Errors raised across component seams.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The sink refused the submission (capacity, shutdown).
    #[error("Submission rejected: {0}")]
    Rejected(String),

    /// The sink could not be reached.
    #[error("Sink unavailable: {0}")]
    Unavailable(String),

    /// Storage failure behind a sink.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
