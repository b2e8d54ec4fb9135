//! # Conveyor Timer
//!
//! Durable timer scheduler for deferred actions: retries with capped
//! exponential backoff, phase timeboxes, cleanups and caller-defined work.
//!
//! Timers are persisted through a [`TimerStore`] so a restart loses
//! nothing. Firing is a conditional `pending -> fired` transition, so a
//! timer fires at most once even with several schedulers on one store.

pub mod action;
pub mod error;
pub mod scheduler;
pub mod schema;
pub mod sqlite;
pub mod store;
pub mod timer;

pub use conveyor_config::SchedulerConfig;

pub use action::{
    ActionContext, CleanupActionHandler, RetryActionHandler, RetryPayload, TimeoutActionHandler,
    TimerActionHandler,
};
pub use error::TimerError;
pub use scheduler::TimerScheduler;
pub use sqlite::SqliteTimerStore;
pub use store::{MemoryTimerStore, TimerStore};
pub use timer::{RetryPolicy, Timer, TimerAction, TimerStatus};
