//! Fixed-window dispatch rate limiter.

use chrono::{DateTime, Duration, Utc};

/// Allows at most `max_per_sec` dispatches per one-second window.
#[derive(Debug)]
pub struct RateLimiter {
    max_per_sec: u32,
    window_start: Option<DateTime<Utc>>,
    count: u32,
}

impl RateLimiter {
    /// `0` disables limiting.
    pub fn new(max_per_sec: u32) -> Self {
        Self {
            max_per_sec,
            window_start: None,
            count: 0,
        }
    }

    /// Whether another dispatch fits in the current window.
    pub fn has_capacity(&mut self, now: DateTime<Utc>) -> bool {
        if self.max_per_sec == 0 {
            return true;
        }
        self.roll(now);
        self.count < self.max_per_sec
    }

    /// Count a dispatch.
    pub fn record(&mut self, now: DateTime<Utc>) {
        self.roll(now);
        self.count = self.count.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.window_start = None;
        self.count = 0;
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        let expired = self
            .window_start
            .is_none_or(|start| now - start >= Duration::seconds(1));
        if expired {
            self.window_start = Some(now);
            self.count = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_within_window() {
        let mut limiter = RateLimiter::new(2);
        let now = Utc::now();
        assert!(limiter.has_capacity(now));
        limiter.record(now);
        limiter.record(now);
        assert!(!limiter.has_capacity(now + Duration::milliseconds(900)));
        assert!(limiter.has_capacity(now + Duration::milliseconds(1000)));
    }

    #[test]
    fn test_zero_is_unlimited() {
        let mut limiter = RateLimiter::new(0);
        let now = Utc::now();
        for _ in 0..1000 {
            limiter.record(now);
        }
        assert!(limiter.has_capacity(now));
    }
}
