//! # Conveyor Protocols
//!
//! Shared protocol definitions for the Conveyor execution core.
//! Contains the seams between components - no scheduling logic.
//!
//! ## Core Traits
//!
//! - [`Clock`] - Wall-clock abstraction (`now`, `sleep`)
//! - [`EventPublisher`] - Typed event channel for published signals
//! - [`WorkSink`] - Generic work submission target
//! - [`CheckpointSink`] - Coarse whole-activity snapshots
//! - [`StepRecorder`] - Optional observability sink

pub mod clock;
pub mod error;
pub mod event;
pub mod sink;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock, to_chrono};
pub use error::ProtocolError;
pub use event::{
    ActivityEvent, BroadcastPublisher, CoreEvent, EventPublisher, NoopPublisher, QueueEvent,
    TimerEvent,
};
pub use sink::{
    ActivityCheckpoint, CheckpointSink, StepRecord, StepRecorder, StepStatus, TracingStepRecorder,
    WorkSink, record_step,
};
pub use types::{OwnerRef, WorkItem};
