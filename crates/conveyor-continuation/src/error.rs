//! Continuation errors.

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Continuation manager error types.
#[derive(Debug, Error)]
pub enum ContinuationError {
    /// Chunk count exceeds the safety ceiling. Fatal; never retried.
    #[error("Activity would produce {chunks} chunks, exceeding the limit of {max}")]
    TooManyChunks { chunks: usize, max: usize },

    /// Activity definition is unusable (zero chunk size, duplicate keys).
    #[error("Invalid activity: {0}")]
    InvalidActivity(String),

    /// A chunk failed. Resume from `token_id` to repeat it.
    #[error("Chunk {chunk_index} of activity '{activity_id}' failed: {reason} (resume token {token_id})")]
    ChunkFailed {
        activity_id: String,
        chunk_index: usize,
        token_id: Uuid,
        reason: String,
    },

    /// Raised by chunk processors to fail the current chunk.
    #[error("Processing failed: {0}")]
    Processing(String),

    /// Token not found.
    #[error("Continuation token not found: {0}")]
    TokenNotFound(Uuid),

    /// Token is past its expiry horizon.
    #[error("Continuation token {token_id} expired at {expired_at}")]
    TokenExpired {
        token_id: Uuid,
        expired_at: DateTime<Utc>,
    },

    /// Token belongs to a different activity.
    #[error("Continuation token {token_id} belongs to activity '{found}', not '{expected}'")]
    TokenMismatch {
        token_id: Uuid,
        expected: String,
        found: String,
    },

    /// Stored value could not be interpreted.
    #[error("Invalid token data: {0}")]
    InvalidData(String),

    /// Checkpoint sink failure.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Database error.
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<tokio_rusqlite::Error> for ContinuationError {
    fn from(e: tokio_rusqlite::Error) -> Self {
        ContinuationError::Database(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_failed_message_names_token() {
        let token_id = Uuid::nil();
        let err = ContinuationError::ChunkFailed {
            activity_id: "index-repo".to_string(),
            chunk_index: 1,
            token_id,
            reason: "boom".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("Chunk 1 of activity 'index-repo' failed: boom"));
        assert!(message.contains(&token_id.to_string()));
    }

    #[test]
    fn test_too_many_chunks_message() {
        let err = ContinuationError::TooManyChunks { chunks: 12, max: 10 };
        assert_eq!(
            err.to_string(),
            "Activity would produce 12 chunks, exceeding the limit of 10"
        );
    }
}
