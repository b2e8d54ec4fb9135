//! Caller-supplied chunked activities.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conveyor_protocols::OwnerRef;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ContinuationError;

/// An item of a chunked activity.
///
/// The key identifies the item in continuation tokens and must be unique
/// within one activity.
pub trait ChunkItem: Clone + Send + Sync {
    fn key(&self) -> String;
}

impl ChunkItem for String {
    fn key(&self) -> String {
        self.clone()
    }
}

impl ChunkItem for u64 {
    fn key(&self) -> String {
        self.to_string()
    }
}

impl ChunkItem for serde_json::Value {
    fn key(&self) -> String {
        match self {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Processes one chunk against the state accumulated so far.
///
/// Chunks run strictly in order, so later chunks may depend on state built
/// by earlier ones. Returning an error fails the chunk.
#[async_trait]
pub trait ChunkProcessor<I: ChunkItem>: Send + Sync {
    type Output: Send;

    async fn process_chunk(
        &self,
        items: &[I],
        state: serde_json::Value,
    ) -> Result<(Vec<Self::Output>, serde_json::Value), ContinuationError>;
}

#[async_trait]
impl<I, T> ChunkProcessor<I> for Arc<T>
where
    I: ChunkItem + 'static,
    T: ChunkProcessor<I> + ?Sized,
{
    type Output = T::Output;

    async fn process_chunk(
        &self,
        items: &[I],
        state: serde_json::Value,
    ) -> Result<(Vec<Self::Output>, serde_json::Value), ContinuationError> {
        (**self).process_chunk(items, state).await
    }
}

/// Adapter turning an async closure into a [`ChunkProcessor`].
pub struct FnChunkProcessor<F, O> {
    f: F,
    _output: PhantomData<fn() -> O>,
}

#[async_trait]
impl<I, F, Fut, O> ChunkProcessor<I> for FnChunkProcessor<F, O>
where
    I: ChunkItem + 'static,
    F: Fn(Vec<I>, serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(Vec<O>, serde_json::Value), ContinuationError>> + Send + 'static,
    O: Send + 'static,
{
    type Output = O;

    async fn process_chunk(
        &self,
        items: &[I],
        state: serde_json::Value,
    ) -> Result<(Vec<O>, serde_json::Value), ContinuationError> {
        (self.f)(items.to_vec(), state).await
    }
}

/// Wrap an async closure as a chunk processor.
pub fn chunk_fn<F, O>(f: F) -> FnChunkProcessor<F, O> {
    FnChunkProcessor {
        f,
        _output: PhantomData,
    }
}

/// Reported to the chunk callback once a chunk's progress is durable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkProgress {
    pub activity_id: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub items_in_chunk: usize,
    pub items_processed: usize,
    pub progress: f64,
    /// Token to resume after this chunk. After the final chunk it has no
    /// items left.
    pub token_id: Uuid,
}

/// Reported to the completion callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivitySummary {
    pub activity_id: String,
    pub total_chunks: usize,
    /// Chunks run by this invocation.
    pub chunks_processed: usize,
    /// Items run by this invocation.
    pub items_processed: usize,
    pub state: serde_json::Value,
    pub resumed_from: Option<Uuid>,
}

type Validator<O> = Box<dyn Fn(&[O]) -> Result<(), String> + Send + Sync>;
type ChunkCallback<O> = Box<dyn Fn(&ChunkProgress, &[O]) + Send + Sync>;
type CompleteCallback = Box<dyn Fn(&ActivitySummary) + Send + Sync>;

/// A large unit of work to run as sequential, resumable chunks.
///
/// Chunk size, timeout and chunk ceiling fall back to the manager's
/// configuration when unset.
pub struct ChunkedActivity<I: ChunkItem, P: ChunkProcessor<I>> {
    pub(crate) id: String,
    pub(crate) activity_type: String,
    pub(crate) owner: OwnerRef,
    pub(crate) items: Vec<I>,
    pub(crate) chunk_size: Option<usize>,
    pub(crate) chunk_timeout: Option<Duration>,
    pub(crate) max_chunks: Option<usize>,
    pub(crate) initial_state: serde_json::Value,
    pub(crate) metadata: serde_json::Value,
    pub(crate) processor: P,
    pub(crate) validator: Option<Validator<P::Output>>,
    pub(crate) on_chunk_complete: Option<ChunkCallback<P::Output>>,
    pub(crate) on_complete: Option<CompleteCallback>,
}

impl<I: ChunkItem, P: ChunkProcessor<I>> ChunkedActivity<I, P> {
    pub fn new(id: impl Into<String>, items: Vec<I>, processor: P) -> Self {
        Self {
            id: id.into(),
            activity_type: "chunked".to_string(),
            owner: OwnerRef::default(),
            items,
            chunk_size: None,
            chunk_timeout: None,
            max_chunks: None,
            initial_state: serde_json::Value::Null,
            metadata: serde_json::Value::Null,
            processor,
            validator: None,
            on_chunk_complete: None,
            on_complete: None,
        }
    }

    pub fn with_owner(mut self, owner: OwnerRef) -> Self {
        self.owner = owner;
        self
    }

    pub fn with_activity_type(mut self, activity_type: impl Into<String>) -> Self {
        self.activity_type = activity_type.into();
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn with_chunk_timeout(mut self, timeout: Duration) -> Self {
        self.chunk_timeout = Some(timeout);
        self
    }

    /// Override the configured chunk ceiling.
    pub fn with_max_chunks(mut self, max_chunks: usize) -> Self {
        self.max_chunks = Some(max_chunks);
        self
    }

    /// State handed to the first chunk of a fresh run.
    pub fn with_initial_state(mut self, state: serde_json::Value) -> Self {
        self.initial_state = state;
        self
    }

    /// Copied onto every token this activity writes.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Reject a chunk's results. A rejection fails the chunk.
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&[P::Output]) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(Box::new(validator));
        self
    }

    pub fn on_chunk_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ChunkProgress, &[P::Output]) + Send + Sync + 'static,
    {
        self.on_chunk_complete = Some(Box::new(callback));
        self
    }

    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ActivitySummary) + Send + Sync + 'static,
    {
        self.on_complete = Some(Box::new(callback));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn activity_type(&self) -> &str {
        &self.activity_type
    }

    pub fn owner(&self) -> &OwnerRef {
        &self.owner
    }

    pub fn items(&self) -> &[I] {
        &self.items
    }
}
