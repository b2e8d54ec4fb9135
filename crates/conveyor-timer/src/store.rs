//! Timer persistence.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::TimerError;
use crate::timer::{Timer, TimerStatus};

/// Timer store trait.
///
/// Implementations must make [`TimerStore::mark_fired`] and
/// [`TimerStore::cancel`] conditional on the timer still being pending.
#[async_trait]
pub trait TimerStore: Send + Sync {
    /// Persist a new timer.
    async fn insert(&self, timer: &Timer) -> Result<(), TimerError>;

    /// Load a timer by ID.
    async fn get(&self, id: &Uuid) -> Result<Option<Timer>, TimerError>;

    /// Every pending timer, ordered by `fire_at`.
    async fn pending(&self) -> Result<Vec<Timer>, TimerError>;

    /// Pending timers with `fire_at <= now`, ordered by `fire_at`, at most `limit`.
    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Timer>, TimerError>;

    /// `pending -> fired`. Returns `false` if the timer was not pending.
    async fn mark_fired(&self, id: &Uuid, at: DateTime<Utc>) -> Result<bool, TimerError>;

    /// `pending -> cancelled`. Returns `false` if the timer was not pending.
    async fn cancel(&self, id: &Uuid) -> Result<bool, TimerError>;

    /// Timers with the given status (all when `None`), ordered by `fire_at`.
    async fn list(&self, status: Option<TimerStatus>) -> Result<Vec<Timer>, TimerError>;

    /// Delete terminal timers last touched before `older_than`.
    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<usize, TimerError>;
}

/// In-memory timer store.
#[derive(Default)]
pub struct MemoryTimerStore {
    timers: RwLock<HashMap<Uuid, Timer>>,
}

impl MemoryTimerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted(mut timers: Vec<Timer>) -> Vec<Timer> {
    timers.sort_by(|a, b| a.fire_at.cmp(&b.fire_at).then(a.created_at.cmp(&b.created_at)));
    timers
}

#[async_trait]
impl TimerStore for MemoryTimerStore {
    async fn insert(&self, timer: &Timer) -> Result<(), TimerError> {
        self.timers.write().await.insert(timer.id, timer.clone());
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<Timer>, TimerError> {
        Ok(self.timers.read().await.get(id).cloned())
    }

    async fn pending(&self) -> Result<Vec<Timer>, TimerError> {
        self.list(Some(TimerStatus::Pending)).await
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Timer>, TimerError> {
        let timers = self.timers.read().await;
        let mut due = sorted(timers.values().filter(|t| t.is_due(now)).cloned().collect());
        due.truncate(limit);
        Ok(due)
    }

    async fn mark_fired(&self, id: &Uuid, at: DateTime<Utc>) -> Result<bool, TimerError> {
        let mut timers = self.timers.write().await;
        match timers.get_mut(id) {
            Some(timer) if timer.is_pending() => {
                timer.status = TimerStatus::Fired;
                timer.fired_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel(&self, id: &Uuid) -> Result<bool, TimerError> {
        let mut timers = self.timers.write().await;
        match timers.get_mut(id) {
            Some(timer) if timer.is_pending() => {
                timer.status = TimerStatus::Cancelled;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list(&self, status: Option<TimerStatus>) -> Result<Vec<Timer>, TimerError> {
        let timers = self.timers.read().await;
        Ok(sorted(
            timers
                .values()
                .filter(|t| status.is_none_or(|s| t.status == s))
                .cloned()
                .collect(),
        ))
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<usize, TimerError> {
        let mut timers = self.timers.write().await;
        let before = timers.len();
        timers.retain(|_, t| {
            !(t.status.is_terminal() && t.fired_at.unwrap_or(t.created_at) < older_than)
        });
        Ok(before - timers.len())
    }
}
