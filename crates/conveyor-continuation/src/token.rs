//! Continuation token model.

use chrono::{DateTime, Utc};
use conveyor_protocols::OwnerRef;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Persisted snapshot of a chunked activity's progress.
///
/// `processed_items` and `remaining_items` hold item keys. Together they
/// cover the activity's full item set and never overlap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuationToken {
    pub id: Uuid,
    pub owner: OwnerRef,
    pub activity_id: String,
    pub activity_type: String,
    /// Next chunk to run. On failure, the chunk that failed.
    pub chunk_index: usize,
    pub total_chunks: usize,
    /// Accumulated state handed to the next chunk.
    pub state: serde_json::Value,
    pub processed_items: Vec<String>,
    pub remaining_items: Vec<String>,
    /// Fraction of items processed, in `[0, 1]`.
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl ContinuationToken {
    /// Whether the token is past its expiry horizon at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Whether every item has been processed.
    pub fn is_complete(&self) -> bool {
        self.remaining_items.is_empty()
    }
}

/// Fraction of `processed` over `total`; an empty activity is complete.
pub(crate) fn progress_of(processed: usize, total: usize) -> f64 {
    if total == 0 {
        1.0
    } else {
        processed as f64 / total as f64
    }
}
