//! Dispatch queue configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::default_true;

/// Priority dispatch queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Maximum number of queued items.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Maximum number of items handled concurrently.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Processing loop tick in milliseconds.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Maximum dispatches per second (0 = unlimited).
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_sec: u32,

    /// Failures after which an item is dead-lettered.
    #[serde(default = "default_dead_letter_after")]
    pub dead_letter_after_retries: u32,

    /// Size of the rolling processing-time window.
    #[serde(default = "default_sample_size")]
    pub processing_sample_size: usize,

    /// How long shutdown waits for in-flight work (in seconds).
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    #[serde(default)]
    pub back_pressure: BackPressureConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

fn default_max_queue_size() -> usize {
    10_000
}

fn default_max_concurrency() -> usize {
    10
}

fn default_tick_interval() -> u64 {
    50
}

fn default_rate_limit() -> u32 {
    100
}

fn default_dead_letter_after() -> u32 {
    3
}

fn default_sample_size() -> usize {
    100
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            max_concurrency: default_max_concurrency(),
            tick_interval_ms: default_tick_interval(),
            rate_limit_per_sec: default_rate_limit(),
            dead_letter_after_retries: default_dead_letter_after(),
            processing_sample_size: default_sample_size(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            back_pressure: BackPressureConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl DispatchConfig {
    /// Get the tick interval as a Duration.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Get the shutdown timeout as a Duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Admission control as the queue fills.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackPressureConfig {
    /// Whether callers are delayed above `threshold`.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Utilization above which submissions are delayed.
    #[serde(default = "default_threshold")]
    pub threshold: f64,

    /// Utilization at which submissions are shed outright.
    #[serde(default = "default_critical")]
    pub critical: f64,

    /// Delay applied just below `critical` (in milliseconds).
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

fn default_threshold() -> f64 {
    0.7
}

fn default_critical() -> f64 {
    0.9
}

fn default_max_delay() -> u64 {
    1000
}

impl Default for BackPressureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_threshold(),
            critical: default_critical(),
            max_delay_ms: default_max_delay(),
        }
    }
}

/// Per-destination circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Cool-down before a half-open trial (in milliseconds).
    #[serde(default = "default_cooldown")]
    pub cooldown_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown() -> u64 {
    30_000
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Get the cool-down as a Duration.
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}
