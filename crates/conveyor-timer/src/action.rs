//! Timer action handlers.

use std::sync::Arc;

use async_trait::async_trait;
use conveyor_config::SchedulerConfig;
use conveyor_protocols::{
    Clock, CoreEvent, EventPublisher, TimerEvent, WorkItem, WorkSink, to_chrono,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::TimerError;
use crate::store::TimerStore;
use crate::timer::Timer;

/// Payload of a retry timer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPayload {
    /// Item to re-submit.
    pub item: WorkItem,
    /// Attempt this timer was scheduled for (0-based).
    pub attempt: u32,
}

/// Collaborators available to a handler while a timer fires.
pub struct ActionContext<'a> {
    pub config: &'a SchedulerConfig,
    pub clock: &'a dyn Clock,
    pub publisher: &'a dyn EventPublisher,
    pub store: &'a dyn TimerStore,
}

/// Runs the action of a fired timer.
///
/// Errors are logged and isolated by the scheduler.
#[async_trait]
pub trait TimerActionHandler: Send + Sync {
    async fn handle(&self, timer: &Timer, ctx: &ActionContext<'_>) -> Result<(), TimerError>;
}

/// Re-submits a retry timer's item with an incremented retry count.
pub struct RetryActionHandler {
    sink: Arc<dyn WorkSink>,
}

impl RetryActionHandler {
    pub fn new(sink: Arc<dyn WorkSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl TimerActionHandler for RetryActionHandler {
    async fn handle(&self, timer: &Timer, _ctx: &ActionContext<'_>) -> Result<(), TimerError> {
        let payload: RetryPayload = serde_json::from_value(timer.payload.clone())?;
        let item = payload
            .item
            .with_retry_count(payload.attempt.saturating_add(1));
        let item_id = item.id;
        let destination = item.destination.clone();

        self.sink
            .submit(item)
            .await
            .map_err(|e| TimerError::Action(e.to_string()))?;
        debug!(
            "Retry timer {} re-submitted item {} to '{}'",
            timer.id, item_id, destination
        );
        Ok(())
    }
}

/// Publishes a phase-timed-out signal for the timer's owner.
pub struct TimeoutActionHandler;

#[async_trait]
impl TimerActionHandler for TimeoutActionHandler {
    async fn handle(&self, timer: &Timer, ctx: &ActionContext<'_>) -> Result<(), TimerError> {
        info!("Timebox elapsed for {:?} (timer {})", timer.owner, timer.id);
        ctx.publisher
            .publish(CoreEvent::TimerLifecycle(TimerEvent::PhaseTimedOut {
                timer_id: timer.id,
                owner: timer.owner.clone(),
            }));
        Ok(())
    }
}

/// Purges terminal timers past the retention window.
///
/// A payload of `{"retention_hours": n}` overrides the configured window.
pub struct CleanupActionHandler;

#[async_trait]
impl TimerActionHandler for CleanupActionHandler {
    async fn handle(&self, timer: &Timer, ctx: &ActionContext<'_>) -> Result<(), TimerError> {
        let retention = timer
            .payload
            .get("retention_hours")
            .and_then(serde_json::Value::as_u64)
            .map(|h| std::time::Duration::from_secs(h.saturating_mul(3600)))
            .unwrap_or_else(|| ctx.config.terminal_retention());

        let cutoff = ctx.clock.now() - to_chrono(retention);
        let purged = ctx.store.purge_terminal(cutoff).await?;
        info!("Cleanup timer {} purged {} terminal timers", timer.id, purged);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryTimerStore;
    use crate::timer::{TimerAction, TimerStatus};
    use chrono::Duration;
    use conveyor_protocols::{BroadcastPublisher, ManualClock, OwnerRef, ProtocolError};
    use parking_lot::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct CollectingSink {
        items: Mutex<Vec<WorkItem>>,
    }

    #[async_trait]
    impl WorkSink for CollectingSink {
        async fn submit(&self, item: WorkItem) -> Result<Uuid, ProtocolError> {
            let id = item.id;
            self.items.lock().push(item);
            Ok(id)
        }
    }

    struct Fixture {
        config: SchedulerConfig,
        clock: ManualClock,
        publisher: BroadcastPublisher,
        store: MemoryTimerStore,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                config: SchedulerConfig::default(),
                clock: ManualClock::starting_now(),
                publisher: BroadcastPublisher::new(16),
                store: MemoryTimerStore::new(),
            }
        }

        fn ctx(&self) -> ActionContext<'_> {
            ActionContext {
                config: &self.config,
                clock: &self.clock,
                publisher: &self.publisher,
                store: &self.store,
            }
        }
    }

    #[tokio::test]
    async fn test_retry_increments_retry_count() {
        let fx = Fixture::new();
        let sink = Arc::new(CollectingSink::default());
        let handler = RetryActionHandler::new(sink.clone());

        let item = WorkItem::new("deploy", serde_json::json!({"v": 1}));
        let payload = serde_json::to_value(RetryPayload {
            item: item.clone(),
            attempt: 2,
        })
        .unwrap();
        let timer = Timer::new(
            OwnerRef::default(),
            fx.clock.now(),
            TimerAction::Retry,
            payload,
            fx.clock.now(),
        );

        handler.handle(&timer, &fx.ctx()).await.unwrap();
        let items = sink.items.lock();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, item.id);
        assert_eq!(items[0].retry_count, 3);
    }

    #[tokio::test]
    async fn test_retry_rejects_bad_payload() {
        let fx = Fixture::new();
        let handler = RetryActionHandler::new(Arc::new(CollectingSink::default()));
        let timer = Timer::new(
            OwnerRef::default(),
            fx.clock.now(),
            TimerAction::Retry,
            serde_json::json!({"nope": true}),
            fx.clock.now(),
        );
        assert!(handler.handle(&timer, &fx.ctx()).await.is_err());
    }

    #[tokio::test]
    async fn test_timeout_publishes_owner() {
        let fx = Fixture::new();
        let mut rx = fx.publisher.subscribe();
        let owner = OwnerRef::run("run-9").with_phase("build");
        let timer = Timer::new(
            owner.clone(),
            fx.clock.now(),
            TimerAction::Timeout,
            serde_json::Value::Null,
            fx.clock.now(),
        );

        TimeoutActionHandler.handle(&timer, &fx.ctx()).await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            CoreEvent::TimerLifecycle(TimerEvent::PhaseTimedOut {
                timer_id: timer.id,
                owner,
            })
        );
    }

    #[tokio::test]
    async fn test_cleanup_uses_payload_retention() {
        let fx = Fixture::new();
        let now = fx.clock.now();
        let old = Timer::new(
            OwnerRef::default(),
            now - Duration::hours(5),
            TimerAction::Retry,
            serde_json::Value::Null,
            now - Duration::hours(5),
        );
        fx.store.insert(&old).await.unwrap();
        fx.store
            .mark_fired(&old.id, now - Duration::hours(3))
            .await
            .unwrap();

        let cleanup = Timer::new(
            OwnerRef::default(),
            now,
            TimerAction::Cleanup,
            serde_json::json!({"retention_hours": 1}),
            now,
        );
        CleanupActionHandler.handle(&cleanup, &fx.ctx()).await.unwrap();
        assert!(fx.store.get(&old.id).await.unwrap().is_none());
        assert!(
            fx.store
                .list(Some(TimerStatus::Fired))
                .await
                .unwrap()
                .is_empty()
        );
    }
}
