//! Timer scheduler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use conveyor_config::SchedulerConfig;
use conveyor_protocols::{
    Clock, CoreEvent, EventPublisher, NoopPublisher, OwnerRef, SystemClock, TimerEvent, WorkItem,
    WorkSink, to_chrono,
};
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::action::{
    ActionContext, CleanupActionHandler, RetryActionHandler, RetryPayload, TimeoutActionHandler,
    TimerActionHandler,
};
use crate::error::TimerError;
use crate::store::TimerStore;
use crate::timer::{RetryPolicy, Timer, TimerAction};

/// Durable scheduler for deferred actions.
///
/// Timeout and cleanup handlers are registered by default. Retry needs a
/// [`WorkSink`] (see [`TimerScheduler::with_work_sink`]); custom actions
/// need [`TimerScheduler::register_handler`].
pub struct TimerScheduler {
    config: SchedulerConfig,
    store: Arc<dyn TimerStore>,
    clock: Arc<dyn Clock>,
    publisher: Arc<dyn EventPublisher>,
    handlers: RwLock<HashMap<TimerAction, Arc<dyn TimerActionHandler>>>,
    retry_policy: RetryPolicy,
}

impl TimerScheduler {
    pub fn new(config: SchedulerConfig, store: Arc<dyn TimerStore>) -> Self {
        let mut handlers: HashMap<TimerAction, Arc<dyn TimerActionHandler>> = HashMap::new();
        handlers.insert(TimerAction::Timeout, Arc::new(TimeoutActionHandler));
        handlers.insert(TimerAction::Cleanup, Arc::new(CleanupActionHandler));

        Self {
            retry_policy: RetryPolicy::from_config(&config),
            config,
            store,
            clock: Arc::new(SystemClock),
            publisher: Arc::new(NoopPublisher),
            handlers: RwLock::new(handlers),
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

    /// Target for fired retry timers.
    pub fn with_work_sink(self, sink: Arc<dyn WorkSink>) -> Self {
        self.register_handler(TimerAction::Retry, Arc::new(RetryActionHandler::new(sink)));
        self
    }

    /// Install or replace the handler for an action.
    pub fn register_handler(&self, action: TimerAction, handler: Arc<dyn TimerActionHandler>) {
        self.handlers.write().insert(action, handler);
    }

    /// Default retry policy, built from configuration.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Schedule a retry of `item` after capped exponential backoff.
    ///
    /// The default policy has no budget. A policy with `max_attempts` set
    /// fails with [`TimerError::RetryExhausted`] once `attempt` reaches it.
    pub async fn schedule_retry(
        &self,
        item: WorkItem,
        attempt: u32,
        policy: Option<&RetryPolicy>,
    ) -> Result<Timer, TimerError> {
        let policy = policy.unwrap_or(&self.retry_policy);
        if let Some(max_attempts) = policy.max_attempts.filter(|_| !policy.allows(attempt)) {
            return Err(TimerError::RetryExhausted {
                attempt,
                max_attempts,
            });
        }

        let delay = policy.delay_for_attempt(attempt);
        let owner = item.owner.clone();
        let payload = serde_json::to_value(RetryPayload { item, attempt })?;
        let fire_at = self.clock.now() + to_chrono(delay);

        let timer = self.persist(owner, fire_at, TimerAction::Retry, payload).await?;
        debug!(
            "Scheduled retry timer {} (attempt {}, delay {:?})",
            timer.id, attempt, delay
        );
        Ok(timer)
    }

    /// Bound an owner's wall-clock duration.
    pub async fn schedule_timeout(
        &self,
        owner: OwnerRef,
        timebox: Duration,
    ) -> Result<Timer, TimerError> {
        let fire_at = self.clock.now() + to_chrono(timebox);
        let timer = self
            .persist(owner, fire_at, TimerAction::Timeout, serde_json::Value::Null)
            .await?;
        info!("Scheduled timebox {} firing at {}", timer.id, timer.fire_at);
        Ok(timer)
    }

    /// Schedule arbitrary deferred work.
    pub async fn schedule_timer(
        &self,
        fire_at: DateTime<Utc>,
        action: TimerAction,
        payload: serde_json::Value,
    ) -> Result<Timer, TimerError> {
        self.persist(OwnerRef::default(), fire_at, action, payload)
            .await
    }

    /// Schedule a purge of old terminal timers.
    pub async fn schedule_cleanup(
        &self,
        fire_at: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Result<Timer, TimerError> {
        self.schedule_timer(fire_at, TimerAction::Cleanup, payload)
            .await
    }

    async fn persist(
        &self,
        owner: OwnerRef,
        fire_at: DateTime<Utc>,
        action: TimerAction,
        payload: serde_json::Value,
    ) -> Result<Timer, TimerError> {
        let timer = Timer::new(owner, fire_at, action, payload, self.clock.now());
        self.store.insert(&timer).await?;
        Ok(timer)
    }

    /// Cancel a pending timer. Returns `false` if it already fired or was
    /// cancelled.
    pub async fn cancel_timer(&self, id: Uuid) -> Result<bool, TimerError> {
        if self.store.get(&id).await?.is_none() {
            return Err(TimerError::NotFound(id));
        }
        let cancelled = self.store.cancel(&id).await?;
        if cancelled {
            debug!("Cancelled timer {}", id);
        }
        Ok(cancelled)
    }

    /// Cancel every pending timer whose owner is covered by `owner`.
    pub async fn cancel_for_owner(&self, owner: &OwnerRef) -> Result<usize, TimerError> {
        let mut cancelled = 0;
        for timer in self.store.pending().await? {
            if owner.covers(&timer.owner) && self.store.cancel(&timer.id).await? {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            info!("Cancelled {} pending timers for {:?}", cancelled, owner);
        }
        Ok(cancelled)
    }

    /// Pending timers ordered by `fire_at`.
    pub async fn pending_timers(&self) -> Result<Vec<Timer>, TimerError> {
        self.store.pending().await
    }

    pub async fn get_timer(&self, id: Uuid) -> Result<Option<Timer>, TimerError> {
        self.store.get(&id).await
    }

    /// Fire every pending timer already overdue. Run once at startup to
    /// cover downtime.
    pub async fn recover(&self) -> Result<usize, TimerError> {
        let pending = self.store.pending().await?;
        let now = self.clock.now();
        let overdue: Vec<_> = pending.iter().filter(|t| t.fire_at <= now).collect();
        info!(
            "Recovering timers: {} pending, {} overdue",
            pending.len(),
            overdue.len()
        );

        let mut fired = 0;
        for timer in overdue {
            fired += usize::from(self.fire_isolated(timer).await);
        }
        Ok(fired)
    }

    /// Fire due timers in `fire_at` order, at most `batch_size` per scan.
    pub async fn scan_once(&self) -> Result<usize, TimerError> {
        let due = self
            .store
            .due(self.clock.now(), self.config.batch_size.max(1))
            .await?;

        let mut fired = 0;
        for timer in &due {
            fired += usize::from(self.fire_isolated(timer).await);
        }
        if fired > 0 {
            debug!("Scan fired {} timers", fired);
        }
        Ok(fired)
    }

    async fn fire_isolated(&self, timer: &Timer) -> bool {
        match self.fire(timer).await {
            Ok(fired) => fired,
            Err(e) => {
                warn!("Failed to fire timer {}: {}", timer.id, e);
                false
            }
        }
    }

    /// Transition a timer to fired, then run its action.
    ///
    /// Returns `false` if another scan or scheduler got there first. Action
    /// failures are logged and published, never returned.
    pub async fn fire(&self, timer: &Timer) -> Result<bool, TimerError> {
        let now = self.clock.now();
        if !self.store.mark_fired(&timer.id, now).await? {
            debug!("Timer {} no longer pending; skipping", timer.id);
            return Ok(false);
        }

        let action = timer.action.as_str().to_string();
        self.publisher
            .publish(CoreEvent::TimerLifecycle(TimerEvent::Fired {
                timer_id: timer.id,
                action: action.clone(),
            }));

        let handler = self.handlers.read().get(&timer.action).cloned();
        let result = match handler {
            Some(handler) => {
                let ctx = ActionContext {
                    config: &self.config,
                    clock: self.clock.as_ref(),
                    publisher: self.publisher.as_ref(),
                    store: self.store.as_ref(),
                };
                handler.handle(timer, &ctx).await
            }
            None => Err(TimerError::NoHandler(action.clone())),
        };

        if let Err(e) = result {
            error!("Timer {} ({}) action failed: {}", timer.id, action, e);
            self.publisher
                .publish(CoreEvent::TimerLifecycle(TimerEvent::ActionFailed {
                    timer_id: timer.id,
                    action,
                    error: e.to_string(),
                }));
        }
        Ok(true)
    }

    /// Recover overdue timers, then scan every `scan_interval` until
    /// `shutdown` is cancelled.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.recover().await {
                error!("Timer recovery failed: {}", e);
            }

            let period = self.config.scan_interval().max(Duration::from_millis(1));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; recovery already covered it.
            ticker.tick().await;

            info!("Timer scheduler started (scan every {:?})", period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Timer scheduler stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.scan_once().await {
                            warn!("Timer scan failed: {}", e);
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
