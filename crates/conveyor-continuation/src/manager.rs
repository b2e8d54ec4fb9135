//! Continuation manager.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use conveyor_config::ContinuationConfig;
use conveyor_protocols::{
    ActivityCheckpoint, ActivityEvent, CheckpointSink, Clock, CoreEvent, EventPublisher,
    NoopPublisher, OwnerRef, StepRecord, StepRecorder, StepStatus, SystemClock, record_step,
    to_chrono,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::activity::{ActivitySummary, ChunkItem, ChunkProcessor, ChunkProgress, ChunkedActivity};
use crate::error::ContinuationError;
use crate::store::TokenStore;
use crate::token::{ContinuationToken, progress_of};

const ACTOR: &str = "continuation-manager";

/// Lifecycle of a tracked activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Running,
    Failed,
    Completed,
}

/// In-process view of an activity's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityProgress {
    pub activity_id: String,
    pub activity_type: String,
    pub owner: OwnerRef,
    /// Next chunk to run.
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub items_processed: usize,
    pub total_items: usize,
    pub progress: f64,
    pub status: ActivityStatus,
    pub last_token: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

/// Result of a completed chunked run.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkedOutcome<O> {
    /// Outputs of the chunks run by this invocation, in order.
    pub results: Vec<O>,
    pub state: serde_json::Value,
    pub total_chunks: usize,
    pub chunks_processed: usize,
    pub items_processed: usize,
    pub resumed_from: Option<Uuid>,
}

/// Where a run starts: fresh, or from a token.
struct StartPoint {
    chunk_index: usize,
    processed: Vec<String>,
    state: serde_json::Value,
    token_id: Option<Uuid>,
}

/// Runs chunked activities and persists continuation tokens.
///
/// Chunks run strictly sequentially. Each chunk races its timeout on the
/// injected [`Clock`]; a timeout, a processor error and a validator
/// rejection are all chunk failures.
pub struct ContinuationManager {
    config: ContinuationConfig,
    store: Arc<dyn TokenStore>,
    checkpoints: Option<Arc<dyn CheckpointSink>>,
    clock: Arc<dyn Clock>,
    publisher: Arc<dyn EventPublisher>,
    recorder: Option<Arc<dyn StepRecorder>>,
    registry: RwLock<HashMap<String, ActivityProgress>>,
}

impl ContinuationManager {
    pub fn new(config: ContinuationConfig, store: Arc<dyn TokenStore>) -> Self {
        Self {
            config,
            store,
            checkpoints: None,
            clock: Arc::new(SystemClock),
            publisher: Arc::new(NoopPublisher),
            recorder: None,
            registry: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    /// Target for periodic and final activity checkpoints.
    pub fn with_checkpoint_sink(mut self, sink: Arc<dyn CheckpointSink>) -> Self {
        self.checkpoints = Some(sink);
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn StepRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn config(&self) -> &ContinuationConfig {
        &self.config
    }

    /// Run an activity, optionally resuming from a token.
    ///
    /// Fails with [`ContinuationError::TooManyChunks`] before processing
    /// anything if the activity exceeds the chunk ceiling. A failed chunk
    /// returns [`ContinuationError::ChunkFailed`] carrying a token that
    /// points at the failed chunk.
    pub async fn execute_chunked<I, P>(
        &self,
        activity: &ChunkedActivity<I, P>,
        resume: Option<Uuid>,
    ) -> Result<ChunkedOutcome<P::Output>, ContinuationError>
    where
        I: ChunkItem,
        P: ChunkProcessor<I>,
    {
        let chunk_size = activity.chunk_size.unwrap_or(self.config.default_chunk_size);
        if chunk_size == 0 {
            return Err(ContinuationError::InvalidActivity(
                "chunk size must be positive".to_string(),
            ));
        }
        let timeout = activity
            .chunk_timeout
            .unwrap_or_else(|| self.config.default_chunk_timeout());

        let keys: Vec<String> = activity.items.iter().map(ChunkItem::key).collect();
        let mut key_set = HashSet::with_capacity(keys.len());
        for key in &keys {
            if !key_set.insert(key.as_str()) {
                return Err(ContinuationError::InvalidActivity(format!(
                    "duplicate item key '{}'",
                    key
                )));
            }
        }

        let total_items = keys.len();
        let planned_chunks = total_items.div_ceil(chunk_size);
        if let Some(max) = activity.max_chunks.or(self.config.max_chunks) {
            if planned_chunks > max {
                error!(
                    "Activity '{}' needs {} chunks, limit is {}",
                    activity.id, planned_chunks, max
                );
                return Err(ContinuationError::TooManyChunks {
                    chunks: planned_chunks,
                    max,
                });
            }
        }

        let start = match resume {
            Some(token_id) => {
                let token = self.load_resumable(&activity.id, token_id).await?;
                let processed: Vec<String> = token
                    .processed_items
                    .into_iter()
                    .filter(|k| key_set.contains(k.as_str()))
                    .collect();
                StartPoint {
                    chunk_index: token.chunk_index,
                    processed,
                    state: token.state,
                    token_id: Some(token.id),
                }
            }
            None => StartPoint {
                chunk_index: 0,
                processed: Vec::new(),
                state: activity.initial_state.clone(),
                token_id: None,
            },
        };

        let done: HashSet<&str> = start.processed.iter().map(String::as_str).collect();
        let pending: Vec<(I, String)> = activity
            .items
            .iter()
            .zip(&keys)
            .filter(|(_, key)| !done.contains(key.as_str()))
            .map(|(item, key)| (item.clone(), key.clone()))
            .collect();
        let chunks: Vec<&[(I, String)]> = pending.chunks(chunk_size).collect();
        let total_chunks = start.chunk_index + chunks.len();

        match start.token_id {
            Some(token_id) => {
                info!(
                    "Resuming activity '{}' at chunk {}/{} from token {} ({} items left)",
                    activity.id,
                    start.chunk_index,
                    total_chunks,
                    token_id,
                    pending.len()
                );
                self.publish(ActivityEvent::Resumed {
                    activity_id: activity.id.clone(),
                    token_id,
                    chunk_index: start.chunk_index,
                });
            }
            None => {
                info!(
                    "Starting activity '{}': {} items in {} chunks",
                    activity.id, total_items, total_chunks
                );
                self.publish(ActivityEvent::Started {
                    activity_id: activity.id.clone(),
                    total_items,
                    total_chunks,
                });
            }
        }

        let resumed_from = start.token_id;
        let mut processed = start.processed;
        let mut state = start.state;
        self.registry.write().insert(
            activity.id.clone(),
            ActivityProgress {
                activity_id: activity.id.clone(),
                activity_type: activity.activity_type.clone(),
                owner: activity.owner.clone(),
                chunk_index: start.chunk_index,
                total_chunks,
                items_processed: processed.len(),
                total_items,
                progress: progress_of(processed.len(), total_items),
                status: ActivityStatus::Running,
                last_token: resumed_from,
                updated_at: self.clock.now(),
            },
        );

        let mut results = Vec::new();
        let mut items_processed = 0;

        for (offset, chunk) in chunks.iter().enumerate() {
            let chunk_index = start.chunk_index + offset;
            let items: Vec<I> = chunk.iter().map(|(item, _)| item.clone()).collect();
            let started = Instant::now();

            let outputs = match self.run_chunk(activity, &items, state.clone(), timeout).await {
                Ok((outputs, new_state)) => {
                    state = new_state;
                    outputs
                }
                Err(reason) => {
                    let remaining = keys_of(&chunks[offset..]);
                    return Err(self
                        .fail_chunk(
                            activity,
                            chunk_index,
                            total_chunks,
                            &state,
                            &processed,
                            remaining,
                            total_items,
                            reason,
                        )
                        .await);
                }
            };

            processed.extend(chunk.iter().map(|(_, key)| key.clone()));
            items_processed += chunk.len();
            let progress = progress_of(processed.len(), total_items);

            // Persist before anyone observes the chunk.
            let remaining = keys_of(&chunks[offset + 1..]);
            let persisted = self
                .persist_chunk(
                    activity,
                    chunk_index,
                    total_chunks,
                    &state,
                    &processed,
                    remaining,
                    progress,
                )
                .await;
            let token_id = match persisted {
                Ok(token_id) => token_id,
                Err(e) => {
                    self.fail_persist(activity, chunk_index, &e).await;
                    return Err(e);
                }
            };

            debug!(
                "Activity '{}' chunk {}/{} done ({} items, {:.0}%)",
                activity.id,
                chunk_index + 1,
                total_chunks,
                chunk.len(),
                progress * 100.0
            );
            self.publish(ActivityEvent::ChunkCompleted {
                activity_id: activity.id.clone(),
                chunk_index,
                total_chunks,
                progress,
                token_id,
            });
            self.track(&activity.id, |p| {
                p.chunk_index = chunk_index + 1;
                p.items_processed = processed.len();
                p.progress = progress;
                p.last_token = Some(token_id);
            });

            if let Some(callback) = &activity.on_chunk_complete {
                callback(
                    &ChunkProgress {
                        activity_id: activity.id.clone(),
                        chunk_index,
                        total_chunks,
                        items_in_chunk: chunk.len(),
                        items_processed: processed.len(),
                        progress,
                        token_id,
                    },
                    &outputs,
                );
            }
            record_step(
                self.recorder.as_ref(),
                StepRecord::new("chunk_processed", ACTOR, StepStatus::Succeeded)
                    .with_owner(activity.owner.clone())
                    .with_inputs(serde_json::json!({
                        "activity_id": activity.id,
                        "chunk_index": chunk_index,
                        "items": chunk.len(),
                    }))
                    .with_outputs(serde_json::json!({
                        "progress": progress,
                        "token_id": token_id,
                    }))
                    .with_latency_ms(elapsed_ms(started)),
            )
            .await;

            results.extend(outputs);
        }

        let chunks_processed = chunks.len();
        if chunks.is_empty() {
            if let Err(e) = self
                .save_checkpoint(activity, &state, total_chunks, total_chunks, 1.0)
                .await
            {
                self.fail_persist(activity, total_chunks, &e).await;
                return Err(e);
            }
        }

        info!(
            "Activity '{}' completed: {} chunks, {} items this run",
            activity.id, chunks_processed, items_processed
        );
        self.publish(ActivityEvent::Completed {
            activity_id: activity.id.clone(),
            chunks_processed,
            items_processed,
        });
        self.track(&activity.id, |p| {
            p.status = ActivityStatus::Completed;
            p.progress = 1.0;
        });

        let summary = ActivitySummary {
            activity_id: activity.id.clone(),
            total_chunks,
            chunks_processed,
            items_processed,
            state: state.clone(),
            resumed_from,
        };
        if let Some(callback) = &activity.on_complete {
            callback(&summary);
        }
        record_step(
            self.recorder.as_ref(),
            StepRecord::new("activity_completed", ACTOR, StepStatus::Succeeded)
                .with_owner(activity.owner.clone())
                .with_outputs(serde_json::to_value(&summary)?),
        )
        .await;

        Ok(ChunkedOutcome {
            results,
            state,
            total_chunks,
            chunks_processed,
            items_processed,
            resumed_from,
        })
    }

    /// Resume from the newest unexpired token for the activity, or start
    /// fresh when there is none. A finished activity resumes from its
    /// completion token and runs nothing.
    pub async fn resume_latest<I, P>(
        &self,
        activity: &ChunkedActivity<I, P>,
    ) -> Result<ChunkedOutcome<P::Output>, ContinuationError>
    where
        I: ChunkItem,
        P: ChunkProcessor<I>,
    {
        let resume = match self.store.latest_for_activity(&activity.id).await? {
            Some(token) if !token.is_expired(self.clock.now()) => Some(token.id),
            Some(token) => {
                info!(
                    "Latest token {} for '{}' expired at {}; starting fresh",
                    token.id, activity.id, token.expires_at
                );
                None
            }
            None => None,
        };
        self.execute_chunked(activity, resume).await
    }

    async fn load_resumable(
        &self,
        activity_id: &str,
        token_id: Uuid,
    ) -> Result<ContinuationToken, ContinuationError> {
        let token = self
            .store
            .get(&token_id)
            .await?
            .ok_or(ContinuationError::TokenNotFound(token_id))?;

        if token.activity_id != activity_id {
            return Err(ContinuationError::TokenMismatch {
                token_id,
                expected: activity_id.to_string(),
                found: token.activity_id,
            });
        }
        if token.is_expired(self.clock.now()) {
            return Err(ContinuationError::TokenExpired {
                token_id,
                expired_at: token.expires_at,
            });
        }
        Ok(token)
    }

    async fn run_chunk<I, P>(
        &self,
        activity: &ChunkedActivity<I, P>,
        items: &[I],
        state: serde_json::Value,
        timeout: Duration,
    ) -> Result<(Vec<P::Output>, serde_json::Value), String>
    where
        I: ChunkItem,
        P: ChunkProcessor<I>,
    {
        let result = tokio::select! {
            biased;
            result = activity.processor.process_chunk(items, state) => result,
            _ = self.clock.sleep(timeout) => {
                return Err(format!("chunk timed out after {:?}", timeout));
            }
        };

        let (outputs, new_state) = result.map_err(|e| e.to_string())?;
        if let Some(validator) = &activity.validator {
            validator(&outputs).map_err(|reason| format!("validation rejected chunk: {}", reason))?;
        }
        Ok((outputs, new_state))
    }

    #[allow(clippy::too_many_arguments)]
    async fn fail_chunk<I, P>(
        &self,
        activity: &ChunkedActivity<I, P>,
        chunk_index: usize,
        total_chunks: usize,
        state: &serde_json::Value,
        processed: &[String],
        remaining: Vec<String>,
        total_items: usize,
        reason: String,
    ) -> ContinuationError
    where
        I: ChunkItem,
        P: ChunkProcessor<I>,
    {
        warn!(
            "Activity '{}' chunk {} failed: {}",
            activity.id, chunk_index, reason
        );

        let progress = progress_of(processed.len(), total_items);
        let token = self.new_token(
            activity,
            chunk_index,
            total_chunks,
            state,
            processed,
            remaining,
            progress,
        );
        if let Err(e) = self.store.save(&token).await {
            error!(
                "Could not persist failure token for '{}' chunk {}: {}",
                activity.id, chunk_index, e
            );
            self.mark_failed(activity, chunk_index, None, format!("{}: {}", reason, e))
                .await;
            return e;
        }

        self.mark_failed(activity, chunk_index, Some(token.id), reason.clone())
            .await;
        ContinuationError::ChunkFailed {
            activity_id: activity.id.clone(),
            chunk_index,
            token_id: token.id,
            reason,
        }
    }

    /// Save the token that resumes after `chunk_index`. The final chunk
    /// first writes the activity checkpoint; its token has nothing left to
    /// run, so resuming a finished activity is a no-op.
    #[allow(clippy::too_many_arguments)]
    async fn persist_chunk<I, P>(
        &self,
        activity: &ChunkedActivity<I, P>,
        chunk_index: usize,
        total_chunks: usize,
        state: &serde_json::Value,
        processed: &[String],
        remaining: Vec<String>,
        progress: f64,
    ) -> Result<Uuid, ContinuationError>
    where
        I: ChunkItem,
        P: ChunkProcessor<I>,
    {
        let next = chunk_index + 1;
        let is_final = remaining.is_empty();
        if is_final {
            self.save_checkpoint(activity, state, next, total_chunks, progress)
                .await?;
        }

        let token = self.new_token(
            activity,
            next,
            total_chunks,
            state,
            processed,
            remaining,
            progress,
        );
        self.store.save(&token).await?;

        let interval = self.config.checkpoint_interval;
        if !is_final && interval > 0 && next % interval == 0 {
            if let Err(e) = self
                .save_checkpoint(activity, state, next, total_chunks, progress)
                .await
            {
                warn!("Periodic checkpoint for '{}' failed: {}", activity.id, e);
            }
        }
        Ok(token.id)
    }

    /// A chunk ran but its progress could not be persisted. The previous
    /// token still points at the chunk.
    async fn fail_persist<I, P>(
        &self,
        activity: &ChunkedActivity<I, P>,
        chunk_index: usize,
        error: &ContinuationError,
    ) where
        I: ChunkItem,
        P: ChunkProcessor<I>,
    {
        error!(
            "Could not persist progress for '{}' chunk {}: {}",
            activity.id, chunk_index, error
        );
        self.mark_failed(activity, chunk_index, None, error.to_string())
            .await;
    }

    async fn mark_failed<I, P>(
        &self,
        activity: &ChunkedActivity<I, P>,
        chunk_index: usize,
        token_id: Option<Uuid>,
        reason: String,
    ) where
        I: ChunkItem,
        P: ChunkProcessor<I>,
    {
        self.publish(ActivityEvent::ChunkFailed {
            activity_id: activity.id.clone(),
            chunk_index,
            token_id,
            error: reason.clone(),
        });
        self.track(&activity.id, |p| {
            p.status = ActivityStatus::Failed;
            if token_id.is_some() {
                p.last_token = token_id;
            }
        });
        record_step(
            self.recorder.as_ref(),
            StepRecord::new("chunk_failed", ACTOR, StepStatus::Failed)
                .with_owner(activity.owner.clone())
                .with_inputs(serde_json::json!({
                    "activity_id": activity.id,
                    "chunk_index": chunk_index,
                }))
                .with_outputs(serde_json::json!({
                    "error": reason,
                    "token_id": token_id,
                })),
        )
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    fn new_token<I, P>(
        &self,
        activity: &ChunkedActivity<I, P>,
        chunk_index: usize,
        total_chunks: usize,
        state: &serde_json::Value,
        processed: &[String],
        remaining: Vec<String>,
        progress: f64,
    ) -> ContinuationToken
    where
        I: ChunkItem,
        P: ChunkProcessor<I>,
    {
        let now = self.clock.now();
        ContinuationToken {
            id: Uuid::new_v4(),
            owner: activity.owner.clone(),
            activity_id: activity.id.clone(),
            activity_type: activity.activity_type.clone(),
            chunk_index,
            total_chunks,
            state: state.clone(),
            processed_items: processed.to_vec(),
            remaining_items: remaining,
            progress,
            created_at: now,
            expires_at: now + to_chrono(self.config.token_ttl()),
            metadata: activity.metadata.clone(),
        }
    }

    async fn save_checkpoint<I, P>(
        &self,
        activity: &ChunkedActivity<I, P>,
        state: &serde_json::Value,
        chunk_index: usize,
        total_chunks: usize,
        progress: f64,
    ) -> Result<(), ContinuationError>
    where
        I: ChunkItem,
        P: ChunkProcessor<I>,
    {
        let Some(sink) = &self.checkpoints else {
            return Ok(());
        };
        let checkpoint = ActivityCheckpoint::new(
            activity.owner.clone(),
            activity.id.clone(),
            serde_json::json!({
                "activity_type": activity.activity_type,
                "chunk_index": chunk_index,
                "total_chunks": total_chunks,
                "progress": progress,
                "state": state,
            }),
            self.clock.now(),
            ACTOR,
        );
        sink.save_checkpoint(checkpoint)
            .await
            .map_err(|e| ContinuationError::Checkpoint(e.to_string()))
    }

    /// Load a token by ID.
    pub async fn get_token(&self, id: Uuid) -> Result<Option<ContinuationToken>, ContinuationError> {
        self.store.get(&id).await
    }

    /// Tokens, oldest first. Filtered to one activity when given.
    pub async fn list_tokens(
        &self,
        activity_id: Option<&str>,
    ) -> Result<Vec<ContinuationToken>, ContinuationError> {
        self.store.list(activity_id).await
    }

    /// Delete tokens past their expiry horizon.
    pub async fn purge_expired(&self) -> Result<usize, ContinuationError> {
        let purged = self.store.purge_expired(self.clock.now()).await?;
        if purged > 0 {
            info!("Purged {} expired continuation tokens", purged);
        }
        Ok(purged)
    }

    /// Progress of an activity run by this manager.
    pub fn progress(&self, activity_id: &str) -> Option<ActivityProgress> {
        self.registry.read().get(activity_id).cloned()
    }

    /// Activities currently running, ordered by ID.
    pub fn active_activities(&self) -> Vec<ActivityProgress> {
        let mut active: Vec<_> = self
            .registry
            .read()
            .values()
            .filter(|p| p.status == ActivityStatus::Running)
            .cloned()
            .collect();
        active.sort_by(|a, b| a.activity_id.cmp(&b.activity_id));
        active
    }

    /// Forget every tracked activity. Persisted tokens are untouched.
    pub fn clear(&self) {
        self.registry.write().clear();
    }

    fn track(&self, activity_id: &str, update: impl FnOnce(&mut ActivityProgress)) {
        let now = self.clock.now();
        if let Some(progress) = self.registry.write().get_mut(activity_id) {
            update(progress);
            progress.updated_at = now;
        }
    }

    fn publish(&self, event: ActivityEvent) {
        self.publisher.publish(CoreEvent::ActivityProgressed(event));
    }
}

fn keys_of<I>(chunks: &[&[(I, String)]]) -> Vec<String> {
    chunks
        .iter()
        .flat_map(|chunk| chunk.iter().map(|(_, key)| key.clone()))
        .collect()
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
