//! Timer scheduler and continuation configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Durable timer scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Period between scans for due timers (in seconds).
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,

    /// Maximum timers fired per scan.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Base retry delay (in milliseconds).
    #[serde(default = "default_retry_base")]
    pub retry_base_delay_ms: u64,

    /// Retry delay ceiling (in milliseconds).
    #[serde(default = "default_retry_max")]
    pub retry_max_delay_ms: u64,

    /// Attempts allowed by the default retry policy. Unbounded when unset;
    /// dead-lettering then stays with the caller.
    #[serde(default)]
    pub retry_max_attempts: Option<u32>,

    /// How long fired/cancelled timers are kept before cleanup (in hours).
    #[serde(default = "default_retention")]
    pub terminal_retention_hours: u64,
}

fn default_scan_interval() -> u64 {
    10
}

fn default_batch_size() -> usize {
    100
}

fn default_retry_base() -> u64 {
    1000
}

fn default_retry_max() -> u64 {
    300_000
}

fn default_retention() -> u64 {
    168
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval(),
            batch_size: default_batch_size(),
            retry_base_delay_ms: default_retry_base(),
            retry_max_delay_ms: default_retry_max(),
            retry_max_attempts: None,
            terminal_retention_hours: default_retention(),
        }
    }
}

impl SchedulerConfig {
    /// Get the scan interval as a Duration.
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    /// Get the terminal timer retention as a Duration.
    pub fn terminal_retention(&self) -> Duration {
        Duration::from_secs(self.terminal_retention_hours * 3600)
    }
}

/// Continuation manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuationConfig {
    /// Chunk size used when an activity does not set one.
    #[serde(default = "default_chunk_size")]
    pub default_chunk_size: usize,

    /// Per-chunk timeout used when an activity does not set one (in seconds).
    #[serde(default = "default_chunk_timeout")]
    pub default_chunk_timeout_secs: u64,

    /// Persist a full activity checkpoint every N chunks.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,

    /// Token lifetime (in hours).
    #[serde(default = "default_token_ttl")]
    pub token_ttl_hours: u64,

    /// Safety ceiling on the number of chunks an activity may produce.
    #[serde(default)]
    pub max_chunks: Option<usize>,
}

fn default_chunk_size() -> usize {
    10
}

fn default_chunk_timeout() -> u64 {
    300
}

fn default_checkpoint_interval() -> usize {
    5
}

fn default_token_ttl() -> u64 {
    24
}

impl Default for ContinuationConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: default_chunk_size(),
            default_chunk_timeout_secs: default_chunk_timeout(),
            checkpoint_interval: default_checkpoint_interval(),
            token_ttl_hours: default_token_ttl(),
            max_chunks: None,
        }
    }
}

impl ContinuationConfig {
    /// Get the default chunk timeout as a Duration.
    pub fn default_chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.default_chunk_timeout_secs)
    }

    /// Get the token lifetime as a Duration.
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_hours * 3600)
    }
}
