//! Timer model and retry policy.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use conveyor_config::SchedulerConfig;
use conveyor_protocols::OwnerRef;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TimerError;

/// Deferred action kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerAction {
    /// Re-submit a work item.
    Retry,
    /// A timebox elapsed.
    Timeout,
    /// Housekeeping.
    Cleanup,
    /// Caller-defined.
    Custom,
}

impl TimerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerAction::Retry => "retry",
            TimerAction::Timeout => "timeout",
            TimerAction::Cleanup => "cleanup",
            TimerAction::Custom => "custom",
        }
    }
}

impl fmt::Display for TimerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimerAction {
    type Err = TimerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retry" => Ok(TimerAction::Retry),
            "timeout" => Ok(TimerAction::Timeout),
            "cleanup" => Ok(TimerAction::Cleanup),
            "custom" => Ok(TimerAction::Custom),
            other => Err(TimerError::InvalidData(format!("unknown action '{}'", other))),
        }
    }
}

/// Timer lifecycle. `Fired` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerStatus {
    Pending,
    Fired,
    Cancelled,
}

impl TimerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerStatus::Pending => "pending",
            TimerStatus::Fired => "fired",
            TimerStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TimerStatus::Pending)
    }
}

impl fmt::Display for TimerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimerStatus {
    type Err = TimerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TimerStatus::Pending),
            "fired" => Ok(TimerStatus::Fired),
            "cancelled" => Ok(TimerStatus::Cancelled),
            other => Err(TimerError::InvalidData(format!("unknown status '{}'", other))),
        }
    }
}

/// A persisted deferred action.
///
/// `fire_at` never changes after creation; only firing or cancellation
/// mutate a timer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timer {
    pub id: Uuid,
    /// Owning run/phase/task, if any.
    #[serde(default)]
    pub owner: OwnerRef,
    pub fire_at: DateTime<Utc>,
    pub action: TimerAction,
    pub payload: serde_json::Value,
    pub status: TimerStatus,
    pub created_at: DateTime<Utc>,
    pub fired_at: Option<DateTime<Utc>>,
}

impl Timer {
    /// New pending timer.
    pub fn new(
        owner: OwnerRef,
        fire_at: DateTime<Utc>,
        action: TimerAction,
        payload: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner,
            fire_at,
            action,
            payload,
            status: TimerStatus::Pending,
            created_at,
            fired_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == TimerStatus::Pending
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.fire_at <= now
    }
}

/// Capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Attempt budget; `None` never rejects.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            max_attempts: config.retry_max_attempts,
        }
    }

    /// `min(base * 2^attempt, max_delay)`, saturating.
    ///
    /// No jitter is applied.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Whether `attempt` is still within budget.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt < max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_from_base() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(4000));
    }

    #[test]
    fn test_backoff_caps_at_max_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(300_000));
        assert_eq!(policy.delay_for_attempt(64), Duration::from_millis(300_000));
    }

    #[test]
    fn test_backoff_never_decreases() {
        let policy = RetryPolicy::default();
        let delays: Vec<_> = (0..40).map(|a| policy.delay_for_attempt(a)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_allows_within_budget() {
        let policy = RetryPolicy {
            max_attempts: Some(3),
            ..Default::default()
        };
        assert!(policy.allows(2));
        assert!(!policy.allows(3));
        assert!(RetryPolicy::default().allows(u32::MAX));
    }

    #[test]
    fn test_action_and_status_parse() {
        for action in [
            TimerAction::Retry,
            TimerAction::Timeout,
            TimerAction::Cleanup,
            TimerAction::Custom,
        ] {
            assert_eq!(action.as_str().parse::<TimerAction>().unwrap(), action);
        }
        assert!("snooze".parse::<TimerAction>().is_err());
        assert_eq!("cancelled".parse::<TimerStatus>().unwrap(), TimerStatus::Cancelled);
        assert!(TimerStatus::Fired.is_terminal());
    }

    #[test]
    fn test_is_due() {
        let now = Utc::now();
        let mut timer = Timer::new(
            OwnerRef::default(),
            now,
            TimerAction::Cleanup,
            serde_json::Value::Null,
            now,
        );
        assert!(timer.is_due(now));
        timer.status = TimerStatus::Fired;
        assert!(!timer.is_due(now));
    }
}
