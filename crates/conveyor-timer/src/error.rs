//! Timer errors.

use thiserror::Error;
use uuid::Uuid;

/// Timer scheduler error types.
#[derive(Debug, Error)]
pub enum TimerError {
    /// Timer not found.
    #[error("Timer not found: {0}")]
    NotFound(Uuid),

    /// Retry budget exhausted; no timer was created.
    #[error("Retry attempt {attempt} exceeds budget of {max_attempts}")]
    RetryExhausted { attempt: u32, max_attempts: u32 },

    /// Stored value could not be interpreted.
    #[error("Invalid timer data: {0}")]
    InvalidData(String),

    /// No handler is registered for an action.
    #[error("No handler registered for '{0}' timers")]
    NoHandler(String),

    /// An action handler failed.
    #[error("Timer action failed: {0}")]
    Action(String),

    /// Database error.
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<tokio_rusqlite::Error> for TimerError {
    fn from(e: tokio_rusqlite::Error) -> Self {
        TimerError::Database(e.to_string())
    }
}
