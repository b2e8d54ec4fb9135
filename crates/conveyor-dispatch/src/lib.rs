//! # Conveyor Dispatch
//!
//! Priority dispatch queue for the Conveyor execution core.
//!
//! ## Features
//!
//! - Binary-heap ordering: priority first, FIFO within a priority band
//! - Back-pressure (proportional delay) and load shedding near capacity
//! - Per-destination circuit breakers with a single half-open trial
//! - Concurrent topic fan-out to every subscribed handler
//! - Retry with a durable dead-letter store

pub mod backpressure;
pub mod breaker;
pub mod dead_letter;
pub mod error;
pub mod fan;
pub mod handler;
pub mod heap;
pub mod processor;
pub mod queue;
pub mod rate_limit;

pub use conveyor_config::{BackPressureConfig, CircuitBreakerConfig, DispatchConfig};

pub use backpressure::{Admission, HARD_SHED_CEILING};
pub use breaker::{CircuitBreakers, CircuitState};
pub use dead_letter::{DeadLetterEntry, DeadLetterStore, FileDeadLetterStore, MemoryDeadLetterStore};
pub use error::DispatchError;
pub use fan::FanOutReceipt;
pub use handler::{FnHandler, WorkHandler, handler_fn};
pub use processor::ShutdownReport;
pub use queue::{DispatchQueue, QueueStats, SubscriptionId};
