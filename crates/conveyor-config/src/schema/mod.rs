//! Configuration schema definitions.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

mod schema_dispatch;
mod schema_runtime;

pub use schema_dispatch::*;
pub use schema_runtime::*;

/// Shared default helper used by submodules.
pub(crate) fn default_true() -> bool {
    true
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub continuation: ContinuationConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Persistent store locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database holding `timers` and `continuation_tokens`.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Directory for whole-activity checkpoints.
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,

    /// Directory for dead-letter entries.
    #[serde(default = "default_dead_letter_dir")]
    pub dead_letter_dir: PathBuf,
}

fn conveyor_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".conveyor"))
        .unwrap_or_else(|| PathBuf::from("/tmp/conveyor"))
}

fn default_database_path() -> PathBuf {
    conveyor_dir().join("conveyor.db")
}

fn default_checkpoint_dir() -> PathBuf {
    conveyor_dir().join("checkpoints")
}

fn default_dead_letter_dir() -> PathBuf {
    conveyor_dir().join("dead_letter")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            checkpoint_dir: default_checkpoint_dir(),
            dead_letter_dir: default_dead_letter_dir(),
        }
    }
}

impl StoreConfig {
    /// Expand `~` in every path.
    pub fn expand_paths(&mut self) {
        for path in [
            &mut self.database_path,
            &mut self.checkpoint_dir,
            &mut self.dead_letter_dir,
        ] {
            let expanded = shellexpand::tilde(&path.to_string_lossy()).to_string();
            *path = PathBuf::from(expanded);
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable text.
    #[serde(default)]
    pub json: bool,

    /// Directory for daily-rotated log files (console only when unset).
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            log_dir: None,
        }
    }
}

#[cfg(test)]
#[path = "schema_tests.rs"]
mod tests;
