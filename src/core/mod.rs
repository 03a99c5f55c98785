//! Core domain models for the build engine.
//!
//! This module contains the task definitions, per-run task state and the
//! validated dependency graph.

pub mod dag;
pub mod task;

pub use dag::{EdgeKind, TaskGraph};
pub use task::{Action, RunId, Task, TaskRun, TaskState};
