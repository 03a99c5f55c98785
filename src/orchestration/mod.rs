//! Orchestration layer for kiln.
//!
//! This module decides which tasks are stale, runs them on a bounded worker
//! pool in dependency order and summarizes the outcome in a run report.

pub mod detector;
pub mod pool;
pub mod report;
pub mod scheduler;

pub use detector::{ChangeDetector, Classification, StaleReason};
pub use pool::{Completion, Job, WorkerEvent, WorkerPool};
pub use report::{
    RunReport, RunStatus, TaskOutcome, EXIT_CANCELLED, EXIT_FAILED, EXIT_GRAPH_ERROR,
    EXIT_SUCCESS,
};
pub use scheduler::{Scheduler, SchedulerEvent, SchedulerOptions};
