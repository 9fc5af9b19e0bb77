//! Core module - execution dispatch and queueing.
//!
//! This module contains the heart of TaskRelay:
//! - Output buffering with bounded retention
//! - Lifecycle events and subscriber fanout
//! - Process supervision per execution
//! - Per-target FIFO admission control
//! - Session continuity between runs

pub mod dispatcher;
pub mod events;
pub mod execution;
pub mod manager;
pub mod output_buffer;
pub mod queue;
pub mod session;

pub use dispatcher::{Dispatcher, StatePaths};
pub use events::{EventBus, ExecutionEvent, Interest, Subscription, TargetStatus};
pub use execution::{
    DispatchRequest, Execution, ExecutionId, ExecutionResult, ExecutionStatus, Source, Target,
    TargetType,
};
pub use manager::{Attachment, ExecutionManager, RecentEntry};
pub use output_buffer::OutputBuffer;
pub use queue::{CommandQueue, Dispatch, QueueItem};
pub use session::{SessionPreference, SessionStore};
