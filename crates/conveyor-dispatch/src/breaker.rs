//! Per-destination circuit breakers.
//!
//! closed --(N consecutive failures)--> open --(cool-down)--> half-open
//! half-open admits exactly one trial: success closes, failure re-opens.
//! Outcomes of items admitted before the circuit opened are ignored until
//! it closes again.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use conveyor_config::CircuitBreakerConfig;
use conveyor_protocols::to_chrono;
use serde::{Deserialize, Serialize};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Failure tracking for one destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub failure_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub state: CircuitState,
    trial_in_flight: bool,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self {
            failure_count: 0,
            last_failure_time: None,
            state: CircuitState::Closed,
            trial_in_flight: false,
        }
    }
}

/// Result of asking to dispatch to a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// Circuit closed.
    Granted,
    /// The single half-open trial.
    Trial,
    /// Circuit open, or a trial is already running.
    Blocked,
}

/// State change caused by a recorded outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    Opened,
    Closed,
}

/// Breaker table keyed by destination.
#[derive(Debug)]
pub struct CircuitBreakers {
    config: CircuitBreakerConfig,
    states: HashMap<String, CircuitBreakerState>,
}

impl CircuitBreakers {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            states: HashMap::new(),
        }
    }

    /// Ask to dispatch one item to `destination` at `now`.
    pub fn try_acquire(&mut self, destination: &str, now: DateTime<Utc>) -> Permit {
        let Some(entry) = self.states.get_mut(destination) else {
            return Permit::Granted;
        };

        match entry.state {
            CircuitState::Closed => Permit::Granted,
            CircuitState::Open => {
                let cooled = entry
                    .last_failure_time
                    .is_none_or(|at| now - at >= to_chrono(self.config.cooldown()));
                if cooled {
                    entry.state = CircuitState::HalfOpen;
                    entry.trial_in_flight = true;
                    Permit::Trial
                } else {
                    Permit::Blocked
                }
            }
            CircuitState::HalfOpen => {
                if entry.trial_in_flight {
                    Permit::Blocked
                } else {
                    entry.trial_in_flight = true;
                    Permit::Trial
                }
            }
        }
    }

    /// Whether [`CircuitBreakers::try_acquire`] would admit an item now.
    pub fn admits(&self, destination: &str, now: DateTime<Utc>) -> bool {
        let Some(entry) = self.states.get(destination) else {
            return true;
        };
        match entry.state {
            CircuitState::Closed => true,
            CircuitState::Open => entry
                .last_failure_time
                .is_none_or(|at| now - at >= to_chrono(self.config.cooldown())),
            CircuitState::HalfOpen => !entry.trial_in_flight,
        }
    }

    /// Record a successful dispatch. `trial` marks the item admitted with
    /// [`Permit::Trial`]; while the circuit is not closed only its outcome
    /// counts.
    pub fn record_success(&mut self, destination: &str, trial: bool) -> Transition {
        let Some(entry) = self.states.get_mut(destination) else {
            return Transition::None;
        };

        match entry.state {
            CircuitState::Closed => {
                entry.failure_count = 0;
                Transition::None
            }
            CircuitState::HalfOpen if trial => {
                entry.failure_count = 0;
                entry.trial_in_flight = false;
                entry.state = CircuitState::Closed;
                Transition::Closed
            }
            // Admitted before the circuit opened.
            _ => Transition::None,
        }
    }

    /// Record a failed dispatch. See [`CircuitBreakers::record_success`]
    /// for `trial`.
    pub fn record_failure(
        &mut self,
        destination: &str,
        now: DateTime<Utc>,
        trial: bool,
    ) -> Transition {
        let threshold = self.config.failure_threshold;
        let entry = self.states.entry(destination.to_string()).or_default();

        match entry.state {
            CircuitState::Closed => {
                entry.failure_count = entry.failure_count.saturating_add(1);
                entry.last_failure_time = Some(now);
                if entry.failure_count >= threshold {
                    entry.state = CircuitState::Open;
                    Transition::Opened
                } else {
                    Transition::None
                }
            }
            CircuitState::HalfOpen if trial => {
                entry.failure_count = entry.failure_count.saturating_add(1);
                entry.last_failure_time = Some(now);
                entry.state = CircuitState::Open;
                entry.trial_in_flight = false;
                Transition::Opened
            }
            // Late outcomes leave the cool-down and the trial alone.
            _ => Transition::None,
        }
    }

    /// Give back a trial that never reached a handler.
    pub fn release_trial(&mut self, destination: &str) {
        if let Some(entry) = self.states.get_mut(destination) {
            if entry.state == CircuitState::HalfOpen {
                entry.trial_in_flight = false;
            }
        }
    }

    /// Current state for a destination.
    pub fn state(&self, destination: &str) -> CircuitState {
        self.states
            .get(destination)
            .map(|entry| entry.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Snapshot for a destination.
    pub fn snapshot(&self, destination: &str) -> Option<CircuitBreakerState> {
        self.states.get(destination).cloned()
    }

    /// Destinations whose circuit is not closed.
    pub fn open_destinations(&self) -> Vec<String> {
        let mut open: Vec<_> = self
            .states
            .iter()
            .filter(|(_, entry)| entry.state != CircuitState::Closed)
            .map(|(dest, _)| dest.clone())
            .collect();
        open.sort();
        open
    }

    /// Forget a destination's history.
    pub fn reset(&mut self, destination: &str) {
        self.states.remove(destination);
    }

    /// Forget every destination.
    pub fn clear(&mut self) {
        self.states.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn breakers() -> CircuitBreakers {
        CircuitBreakers::new(CircuitBreakerConfig {
            failure_threshold: 5,
            cooldown_ms: 1000,
        })
    }

    #[test]
    fn test_unknown_destination_is_closed() {
        let mut b = breakers();
        assert_eq!(b.state("deploy"), CircuitState::Closed);
        assert_eq!(b.try_acquire("deploy", Utc::now()), Permit::Granted);
    }

    #[test]
    fn test_opens_after_exactly_five_failures() {
        let mut b = breakers();
        let now = Utc::now();
        for _ in 0..4 {
            assert_eq!(b.record_failure("deploy", now, false), Transition::None);
        }
        assert_eq!(b.state("deploy"), CircuitState::Closed);
        assert_eq!(b.record_failure("deploy", now, false), Transition::Opened);
        assert_eq!(b.state("deploy"), CircuitState::Open);
        assert_eq!(b.try_acquire("deploy", now), Permit::Blocked);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let mut b = breakers();
        let now = Utc::now();
        for _ in 0..4 {
            b.record_failure("deploy", now, false);
        }
        b.record_success("deploy", false);
        for _ in 0..4 {
            b.record_failure("deploy", now, false);
        }
        assert_eq!(b.state("deploy"), CircuitState::Closed);
    }

    #[test]
    fn test_single_half_open_trial() {
        let mut b = breakers();
        let now = Utc::now();
        for _ in 0..5 {
            b.record_failure("deploy", now, false);
        }

        let later = now + to_chrono(Duration::from_millis(1000));
        assert_eq!(b.try_acquire("deploy", later), Permit::Trial);
        assert_eq!(b.state("deploy"), CircuitState::HalfOpen);
        for _ in 0..10 {
            assert_eq!(b.try_acquire("deploy", later), Permit::Blocked);
        }

        assert_eq!(b.record_success("deploy", true), Transition::Closed);
        assert_eq!(b.state("deploy"), CircuitState::Closed);
        assert_eq!(b.snapshot("deploy").unwrap().failure_count, 0);
    }

    #[test]
    fn test_failed_trial_reopens_and_restarts_cooldown() {
        let mut b = breakers();
        let now = Utc::now();
        for _ in 0..5 {
            b.record_failure("deploy", now, false);
        }

        let t1 = now + to_chrono(Duration::from_millis(1500));
        assert_eq!(b.try_acquire("deploy", t1), Permit::Trial);
        assert_eq!(b.record_failure("deploy", t1, true), Transition::Opened);
        assert_eq!(b.state("deploy"), CircuitState::Open);

        let t2 = t1 + to_chrono(Duration::from_millis(500));
        assert_eq!(b.try_acquire("deploy", t2), Permit::Blocked);
        let t3 = t1 + to_chrono(Duration::from_millis(1000));
        assert_eq!(b.try_acquire("deploy", t3), Permit::Trial);
    }

    #[test]
    fn test_release_trial_allows_another() {
        let mut b = breakers();
        let now = Utc::now();
        for _ in 0..5 {
            b.record_failure("deploy", now, false);
        }
        let later = now + to_chrono(Duration::from_secs(2));
        assert_eq!(b.try_acquire("deploy", later), Permit::Trial);
        b.release_trial("deploy");
        assert_eq!(b.try_acquire("deploy", later), Permit::Trial);
    }

    #[test]
    fn test_destinations_are_independent() {
        let mut b = breakers();
        let now = Utc::now();
        for _ in 0..5 {
            b.record_failure("deploy", now, false);
        }
        assert_eq!(b.try_acquire("review", now), Permit::Granted);
        assert_eq!(b.open_destinations(), vec!["deploy".to_string()]);

        b.reset("deploy");
        assert_eq!(b.state("deploy"), CircuitState::Closed);
    }

    #[test]
    fn test_late_outcomes_leave_half_open_alone() {
        let mut b = breakers();
        let now = Utc::now();
        for _ in 0..5 {
            b.record_failure("deploy", now, false);
        }
        let later = now + to_chrono(Duration::from_millis(1000));
        assert_eq!(b.try_acquire("deploy", later), Permit::Trial);

        assert_eq!(b.record_success("deploy", false), Transition::None);
        assert_eq!(b.record_failure("deploy", later, false), Transition::None);
        assert_eq!(b.state("deploy"), CircuitState::HalfOpen);
        assert_eq!(b.try_acquire("deploy", later), Permit::Blocked);

        assert_eq!(b.record_success("deploy", true), Transition::Closed);
        assert_eq!(b.state("deploy"), CircuitState::Closed);
    }

    #[test]
    fn test_late_failure_keeps_cooldown() {
        let mut b = breakers();
        let now = Utc::now();
        for _ in 0..5 {
            b.record_failure("deploy", now, false);
        }
        let t1 = now + to_chrono(Duration::from_millis(800));
        assert_eq!(b.record_failure("deploy", t1, false), Transition::None);
        assert_eq!(b.record_success("deploy", false), Transition::None);
        assert_eq!(b.state("deploy"), CircuitState::Open);

        let t2 = now + to_chrono(Duration::from_millis(1000));
        assert!(b.admits("deploy", t2));
        assert_eq!(b.try_acquire("deploy", t2), Permit::Trial);
    }

    #[test]
    fn test_admits_matches_try_acquire() {
        let mut b = breakers();
        let now = Utc::now();
        assert!(b.admits("deploy", now));
        for _ in 0..5 {
            b.record_failure("deploy", now, false);
        }
        assert!(!b.admits("deploy", now));

        let later = now + to_chrono(Duration::from_millis(1000));
        assert!(b.admits("deploy", later));
        assert_eq!(b.try_acquire("deploy", later), Permit::Trial);
        assert!(!b.admits("deploy", later));
        b.release_trial("deploy");
        assert!(b.admits("deploy", later));
    }
}
