//! # Conveyor Continuation
//!
//! Runs a large unit of work as bounded, strictly sequential chunks.
//!
//! After every chunk a [`ContinuationToken`] records what was processed,
//! what remains and the accumulated state, so an interrupted activity
//! resumes from its last token instead of starting over. A failed chunk
//! leaves a token pointing at itself, so retrying repeats it.

pub mod activity;
pub mod checkpoint;
pub mod error;
pub mod manager;
pub mod schema;
pub mod sqlite;
pub mod store;
pub mod token;

pub use conveyor_config::ContinuationConfig;

pub use activity::{
    ActivitySummary, ChunkItem, ChunkProcessor, ChunkProgress, ChunkedActivity, FnChunkProcessor,
    chunk_fn,
};
pub use checkpoint::{FileCheckpointSink, MemoryCheckpointSink};
pub use error::ContinuationError;
pub use manager::{ActivityProgress, ActivityStatus, ChunkedOutcome, ContinuationManager};
pub use sqlite::SqliteTokenStore;
pub use store::{MemoryTokenStore, TokenStore};
pub use token::ContinuationToken;
