//! Typed event channel.
//!
//! Components publish a closed set of [`CoreEvent`] variants through a single
//! injected [`EventPublisher`]. The transport behind the publisher is the
//! caller's concern.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::types::OwnerRef;

/// Every signal the execution core publishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "event", rename_all = "snake_case")]
pub enum CoreEvent {
    /// Dispatch queue state change.
    QueueStateChanged(QueueEvent),
    /// Timer lifecycle.
    TimerLifecycle(TimerEvent),
    /// Chunked activity progress.
    ActivityProgressed(ActivityEvent),
}

/// Dispatch queue signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    Queued {
        item_id: Uuid,
        destination: String,
        priority: i32,
    },
    Completed {
        item_id: Uuid,
        destination: String,
        duration_ms: u64,
    },
    Retried {
        item_id: Uuid,
        destination: String,
        retry_count: u32,
    },
    DeadLettered {
        item_id: Uuid,
        destination: String,
        retry_count: u32,
        error: String,
    },
    /// No handler was subscribed to the destination.
    Dropped { item_id: Uuid, destination: String },
    CircuitOpened { destination: String },
    CircuitClosed { destination: String },
    BackPressureApplied { utilization: f64, delay_ms: u64 },
    LoadShed { utilization: f64 },
}

/// Timer scheduler signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimerEvent {
    Fired { timer_id: Uuid, action: String },
    ActionFailed {
        timer_id: Uuid,
        action: String,
        error: String,
    },
    /// A timebox elapsed.
    PhaseTimedOut { timer_id: Uuid, owner: OwnerRef },
}

/// Continuation manager signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityEvent {
    Started {
        activity_id: String,
        total_items: usize,
        total_chunks: usize,
    },
    Resumed {
        activity_id: String,
        token_id: Uuid,
        chunk_index: usize,
    },
    ChunkCompleted {
        activity_id: String,
        chunk_index: usize,
        total_chunks: usize,
        progress: f64,
        token_id: Uuid,
    },
    ChunkFailed {
        activity_id: String,
        chunk_index: usize,
        /// `None` when no token could be persisted for the failure.
        token_id: Option<Uuid>,
        error: String,
    },
    Completed {
        activity_id: String,
        chunks_processed: usize,
        items_processed: usize,
    },
}

/// Publish capability injected into every component.
pub trait EventPublisher: Send + Sync {
    /// Publish an event. Must not block.
    fn publish(&self, event: CoreEvent);
}

/// Publisher that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

impl EventPublisher for NoopPublisher {
    fn publish(&self, _event: CoreEvent) {}
}

/// In-process fan-out over a tokio broadcast channel.
///
/// Slow subscribers lag and lose the oldest events; publishing never waits.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<CoreEvent>,
}

impl BroadcastPublisher {
    /// Create a publisher buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, event: CoreEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }
}
