//! Sinks consumed by the execution core.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::types::{OwnerRef, WorkItem};

/// Generic work submission target.
///
/// The core is agnostic to how the sink executes work.
#[async_trait]
pub trait WorkSink: Send + Sync {
    /// Submit a fully formed item. Returns the admitted item's ID.
    async fn submit(&self, item: WorkItem) -> Result<Uuid, ProtocolError>;

    /// Submit a payload to a destination with default settings.
    async fn enqueue(
        &self,
        destination: &str,
        payload: serde_json::Value,
    ) -> Result<Uuid, ProtocolError> {
        self.submit(WorkItem::new(destination, payload)).await
    }
}

/// Coarse whole-activity snapshot, independent of continuation tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityCheckpoint {
    /// Checkpoint ID.
    pub id: Uuid,
    /// Owning run/phase/task.
    pub owner: OwnerRef,
    /// Activity the snapshot belongs to.
    pub activity_id: String,
    /// Serialized activity state.
    pub state: serde_json::Value,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Component that wrote the checkpoint.
    pub created_by: String,
}

impl ActivityCheckpoint {
    /// Create a checkpoint stamped at `created_at`.
    pub fn new(
        owner: OwnerRef,
        activity_id: impl Into<String>,
        state: serde_json::Value,
        created_at: DateTime<Utc>,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner,
            activity_id: activity_id.into(),
            state,
            created_at,
            created_by: created_by.into(),
        }
    }
}

/// Checkpoint persistence target.
#[async_trait]
pub trait CheckpointSink: Send + Sync {
    /// Persist a checkpoint.
    async fn save_checkpoint(&self, checkpoint: ActivityCheckpoint) -> Result<(), ProtocolError>;
}

/// Outcome of a recorded step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// One observability record for a major operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub owner: OwnerRef,
    pub step_name: String,
    pub actor: String,
    pub inputs: serde_json::Value,
    pub outputs: serde_json::Value,
    pub cost: f64,
    pub latency_ms: u64,
    pub status: StepStatus,
    pub metadata: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl StepRecord {
    /// Start a record with empty inputs/outputs.
    pub fn new(step_name: impl Into<String>, actor: impl Into<String>, status: StepStatus) -> Self {
        Self {
            owner: OwnerRef::default(),
            step_name: step_name.into(),
            actor: actor.into(),
            inputs: serde_json::Value::Null,
            outputs: serde_json::Value::Null,
            cost: 0.0,
            latency_ms: 0,
            status,
            metadata: serde_json::Value::Null,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_owner(mut self, owner: OwnerRef) -> Self {
        self.owner = owner;
        self
    }

    pub fn with_inputs(mut self, inputs: serde_json::Value) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_outputs(mut self, outputs: serde_json::Value) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Observability sink. Its absence must not affect correctness.
#[async_trait]
pub trait StepRecorder: Send + Sync {
    /// Record a step.
    async fn record(&self, step: StepRecord) -> Result<(), ProtocolError>;
}

/// Recorder that emits steps as structured tracing events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingStepRecorder;

#[async_trait]
impl StepRecorder for TracingStepRecorder {
    async fn record(&self, step: StepRecord) -> Result<(), ProtocolError> {
        info!(
            step = %step.step_name,
            actor = %step.actor,
            status = ?step.status,
            latency_ms = step.latency_ms,
            run_id = step.owner.run_id.as_deref().unwrap_or(""),
            phase_id = step.owner.phase_id.as_deref().unwrap_or(""),
            "step recorded"
        );
        Ok(())
    }
}

/// Record a step on an optional recorder, logging instead of failing.
pub async fn record_step(recorder: Option<&Arc<dyn StepRecorder>>, step: StepRecord) {
    let Some(recorder) = recorder else {
        return;
    };
    let name = step.step_name.clone();
    if let Err(e) = recorder.record(step).await {
        warn!("Failed to record step '{}': {}", name, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CollectingSink {
        items: Mutex<Vec<WorkItem>>,
    }

    #[async_trait]
    impl WorkSink for CollectingSink {
        async fn submit(&self, item: WorkItem) -> Result<Uuid, ProtocolError> {
            let id = item.id;
            self.items.lock().unwrap().push(item);
            Ok(id)
        }
    }

    struct FailingRecorder;

    #[async_trait]
    impl StepRecorder for FailingRecorder {
        async fn record(&self, _step: StepRecord) -> Result<(), ProtocolError> {
            Err(ProtocolError::Unavailable("down".to_string()))
        }
    }

    #[tokio::test]
    async fn test_enqueue_default_builds_item() {
        let sink = CollectingSink {
            items: Mutex::new(Vec::new()),
        };
        let id = sink
            .enqueue("review", serde_json::json!({"pr": 7}))
            .await
            .unwrap();

        let items = sink.items.lock().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, id);
        assert_eq!(items[0].destination, "review");
        assert_eq!(items[0].payload["pr"], 7);
    }

    #[tokio::test]
    async fn test_record_step_swallows_failures() {
        let recorder: Arc<dyn StepRecorder> = Arc::new(FailingRecorder);
        let step = StepRecord::new("chunk_processed", "continuation", StepStatus::Succeeded);
        record_step(Some(&recorder), step.clone()).await;
        record_step(None, step).await;
    }

    #[test]
    fn test_checkpoint_new() {
        let now = Utc::now();
        let cp = ActivityCheckpoint::new(
            OwnerRef::run("r1"),
            "scan",
            serde_json::json!({"n": 1}),
            now,
            "continuation",
        );
        assert_eq!(cp.activity_id, "scan");
        assert_eq!(cp.created_at, now);
        assert_eq!(cp.created_by, "continuation");
    }
}
