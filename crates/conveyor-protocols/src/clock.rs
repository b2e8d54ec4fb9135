//! Clock abstraction.
//!
//! Components read time and wait through a [`Clock`] so tests can swap in
//! a [`ManualClock`] and assert exact backoff and timeout behavior without
//! real sleeping.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

/// Source of wall-clock time and timed delays.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;

    /// Resolve once `duration` has elapsed on this clock.
    async fn sleep(&self, duration: Duration);
}

/// Convert a std duration, saturating at one hundred years.
pub fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Real time backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual clock that only moves when told to.
///
/// `sleep` parks until [`ManualClock::advance`] (or [`ManualClock::set`])
/// moves the clock past the sleeper's deadline.
#[derive(Debug)]
pub struct ManualClock {
    now: watch::Sender<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        let (now, _) = watch::channel(start);
        Self { now }
    }

    /// Create a clock frozen at the current real time.
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    /// Move the clock forward.
    pub fn advance(&self, duration: Duration) {
        let delta = to_chrono(duration);
        self.now.send_modify(|now| *now += delta);
    }

    /// Jump to an absolute time. Moving backwards is ignored.
    pub fn set(&self, at: DateTime<Utc>) {
        self.now.send_modify(|now| {
            if at > *now {
                *now = at;
            }
        });
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::starting_now()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.borrow()
    }

    async fn sleep(&self, duration: Duration) {
        let deadline = self.now() + to_chrono(duration);
        let mut rx = self.now.subscribe();
        loop {
            if *rx.borrow_and_update() >= deadline {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
