//! Dispatch errors.

use thiserror::Error;
use uuid::Uuid;

/// Dispatch queue error types.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Queue is at its configured maximum.
    #[error("Queue saturated: {size}/{max} items queued")]
    QueueSaturated { size: usize, max: usize },

    /// Submission shed above the critical utilization ceiling.
    #[error("Load shed at {:.0}% utilization", .utilization * 100.0)]
    Shed { utilization: f64 },

    /// Queue no longer admits work.
    #[error("Queue is shutting down")]
    ShuttingDown,

    /// A handler reported failure.
    #[error("Handler failed: {0}")]
    HandlerFailed(String),

    /// Fan-in did not hear from every destination in time.
    #[error("Fan-in timed out: received {received} of {expected} messages")]
    FanInTimeout { received: usize, expected: usize },

    /// Dead-letter entry not found.
    #[error("Dead-letter entry not found: {0}")]
    DeadLetterNotFound(Uuid),

    /// Storage error.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl DispatchError {
    /// Whether this is a capacity rejection (saturated or shed).
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::QueueSaturated { .. } | Self::Shed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saturated_message() {
        let err = DispatchError::QueueSaturated { size: 10, max: 10 };
        assert_eq!(err.to_string(), "Queue saturated: 10/10 items queued");
        assert!(err.is_capacity());
    }

    #[test]
    fn test_shed_message() {
        let err = DispatchError::Shed { utilization: 0.93 };
        assert_eq!(err.to_string(), "Load shed at 93% utilization");
        assert!(err.is_capacity());
    }

    #[test]
    fn test_handler_failure_not_capacity() {
        assert!(!DispatchError::HandlerFailed("boom".to_string()).is_capacity());
    }
}
