//! Shared data types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies the pipeline entity that owns a timer, token or step.
///
/// Every field is optional; an empty reference means "unowned".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerRef {
    /// Pipeline run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Phase within the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<String>,
    /// Task within the phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl OwnerRef {
    /// Reference a run.
    pub fn run(run_id: impl Into<String>) -> Self {
        Self {
            run_id: Some(run_id.into()),
            ..Default::default()
        }
    }

    /// Narrow to a phase.
    pub fn with_phase(mut self, phase_id: impl Into<String>) -> Self {
        self.phase_id = Some(phase_id.into());
        self
    }

    /// Narrow to a task.
    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// True when no identifier is set.
    pub fn is_empty(&self) -> bool {
        self.run_id.is_none() && self.phase_id.is_none() && self.task_id.is_none()
    }

    /// Whether `other` falls under this reference.
    ///
    /// Fields left unset here act as wildcards. An empty reference covers
    /// nothing, so a bulk operation keyed on it never matches everything.
    pub fn covers(&self, other: &OwnerRef) -> bool {
        if self.is_empty() {
            return false;
        }
        let field = |mine: &Option<String>, theirs: &Option<String>| match mine {
            Some(m) => theirs.as_deref() == Some(m.as_str()),
            None => true,
        };
        field(&self.run_id, &other.run_id)
            && field(&self.phase_id, &other.phase_id)
            && field(&self.task_id, &other.task_id)
    }
}

/// A unit of work routed to a destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique item ID.
    pub id: Uuid,
    /// Destination (topic) the item is routed to.
    pub destination: String,
    /// Opaque payload handed to handlers.
    pub payload: serde_json::Value,
    /// Priority; higher values are served first.
    pub priority: i32,
    /// When the item was (last) admitted.
    pub enqueued_at: DateTime<Utc>,
    /// Number of failed handling attempts so far.
    pub retry_count: u32,
    /// Correlation ID shared by related items (fan-out groups, retries).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Owning run/phase/task.
    #[serde(default)]
    pub owner: OwnerRef,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl WorkItem {
    /// Create a new item with normal priority.
    pub fn new(destination: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            destination: destination.into(),
            payload,
            priority: 0,
            enqueued_at: Utc::now(),
            retry_count: 0,
            correlation_id: None,
            owner: OwnerRef::default(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Set priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set correlation ID.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set owner.
    pub fn with_owner(mut self, owner: OwnerRef) -> Self {
        self.owner = owner;
        self
    }

    /// Set metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set the retry count. Counts never go backwards.
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = self.retry_count.max(retry_count);
        self
    }
}
