//! The dispatchd runtime.
//!
//! This crate is the dispatcher service proper:
//!
//! - **[`wakeup`]** -- a lazy single-task timer generic over anything that
//!   can report its next deadline; reused for delayed submissions.
//! - **[`process`]** -- worker process supervision behind the
//!   [`process::ProcessSpawner`] seam: subprocess workers over JSON lines on
//!   stdio, plus an in-process variant running the identical loop.
//! - **[`worker`]** -- the worker loop body and the task expression runner.
//! - **[`pool`]** -- the worker pool: slot bookkeeping, duplicate policies,
//!   counters, cancellation, the work-cleared pulse.
//! - **[`control_tasks`]** -- the registry of named control handlers.
//! - **[`dispatcher`]** -- [`dispatcher::DispatcherMain`], the coordinator
//!   that multiplexes producers, delayed tasks, control commands and the
//!   pool on one event loop.

pub mod control_tasks;
pub mod dispatcher;
pub mod error;
pub mod pool;
pub mod process;
pub mod wakeup;
pub mod worker;

pub use dispatcher::{DelayCapsule, DispatcherEvents, DispatcherMain};
pub use error::{Result, ServiceError};
pub use pool::{PoolEvents, WorkerPool};
pub use process::{
    FinishedEvent, InProcessSpawner, ProcessSpawner, SubprocessSpawner, TaskOutcome,
    WorkerCommand, WorkerEvent, WorkerHandle,
};
pub use wakeup::{HasWakeup, NextWakeupRunner};
