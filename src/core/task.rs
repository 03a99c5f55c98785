//! Task data model for the build graph.
//!
//! A `Task` is the immutable definition coming out of the manifest. Per-run
//! bookkeeping lives in `TaskRun`, which only the scheduler mutates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::util::normalize_path;

/// Unique identifier for one invocation of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Create a new unique run identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a task does when it runs.
///
/// The set of kinds is closed. Every kind can be executed, produces an exit
/// status and serializes canonically so it can be fingerprinted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Action {
    /// A command line handed to the platform shell.
    Shell {
        /// The command line.
        command: String,
    },
    /// A program started directly, without a shell.
    Exec {
        /// Program name or path, looked up on `PATH`.
        program: String,
        /// Arguments passed verbatim.
        args: Vec<String>,
    },
    /// Built-in no-op used by pure orchestration tasks.
    Noop,
}

impl Default for Action {
    fn default() -> Self {
        Self::Noop
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Shell { command } => write!(f, "{}", command),
            Action::Exec { program, args } => {
                write!(f, "{}", program)?;
                for arg in args {
                    write!(f, " {}", arg)?;
                }
                Ok(())
            }
            Action::Noop => write!(f, "(noop)"),
        }
    }
}

/// A single task definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique name within the graph.
    pub name: String,
    /// What to run.
    pub action: Action,
    /// Declared input paths, relative to the project root.
    pub inputs: Vec<PathBuf>,
    /// Declared output paths, relative to the project root.
    pub outputs: Vec<PathBuf>,
    /// Names of tasks that must succeed first.
    pub deps: Vec<String>,
    /// Working directory for the action, relative to the project root.
    pub cwd: PathBuf,
    /// Extra environment for the action.
    pub env: BTreeMap<String, String>,
    /// Per-task timeout, overriding the configured default.
    pub timeout: Option<Duration>,
}

impl Task {
    /// Create a no-op task with the given name.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            action: Action::Noop,
            inputs: Vec::new(),
            outputs: Vec::new(),
            deps: Vec::new(),
            cwd: PathBuf::from("."),
            env: BTreeMap::new(),
            timeout: None,
        }
    }

    pub fn shell(name: &str, command: &str) -> Self {
        Self::new(name).with_action(Action::Shell {
            command: command.to_string(),
        })
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.action = action;
        self
    }

    pub fn with_inputs<P: AsRef<Path>>(mut self, inputs: &[P]) -> Self {
        self.inputs = inputs.iter().map(|p| p.as_ref().to_path_buf()).collect();
        self
    }

    pub fn with_outputs<P: AsRef<Path>>(mut self, outputs: &[P]) -> Self {
        self.outputs = outputs.iter().map(|p| p.as_ref().to_path_buf()).collect();
        self
    }

    pub fn with_deps(mut self, deps: &[&str]) -> Self {
        self.deps = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Normalize every path and drop repeated dependency names.
    pub(crate) fn normalized(mut self) -> Self {
        self.inputs = self.inputs.iter().map(|p| normalize_path(p)).collect();
        self.outputs = self.outputs.iter().map(|p| normalize_path(p)).collect();
        self.cwd = normalize_path(&self.cwd);
        let mut seen = std::collections::HashSet::new();
        self.deps.retain(|d| seen.insert(d.clone()));
        self
    }
}

/// Task state within one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskState {
    /// Not classified yet, or left behind by a cancelled run.
    Pending,
    /// Nothing changed since the last successful run.
    UpToDate,
    /// Needs to run.
    Stale,
    /// Currently executing.
    Running,
    /// Ran and its fingerprints were committed.
    Succeeded,
    /// Ran and failed, or could not be run.
    Failed {
        /// Why the task failed.
        reason: String,
    },
    /// Not run because a dependency failed.
    Skipped {
        /// The failed task that caused the skip.
        upstream: String,
    },
}

impl Default for TaskState {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskState {
    /// Whether the task has reached a final state for this run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::UpToDate
                | TaskState::Succeeded
                | TaskState::Failed { .. }
                | TaskState::Skipped { .. }
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "Pending"),
            TaskState::UpToDate => write!(f, "UpToDate"),
            TaskState::Stale => write!(f, "Stale"),
            TaskState::Running => write!(f, "Running"),
            TaskState::Succeeded => write!(f, "Succeeded"),
            TaskState::Failed { reason } => write!(f, "Failed: {}", reason),
            TaskState::Skipped { upstream } => write!(f, "Skipped: {}", upstream),
        }
    }
}

/// Per-run bookkeeping for one task.
#[derive(Debug, Clone, Default)]
pub struct TaskRun {
    /// Current state.
    pub state: TaskState,
    /// Why the change detector wanted the task to run.
    pub reason: Option<String>,
    /// When execution started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state after execution.
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRun {
    pub fn mark_up_to_date(&mut self) {
        self.state = TaskState::UpToDate;
    }

    pub fn mark_stale(&mut self, reason: String) {
        self.state = TaskState::Stale;
        self.reason = Some(reason);
    }

    /// Transition to Running and record the start time.
    pub fn start(&mut self) {
        self.state = TaskState::Running;
        self.started_at = Some(Utc::now());
    }

    /// Transition to Succeeded and record the finish time.
    pub fn succeed(&mut self) {
        self.state = TaskState::Succeeded;
        self.finished_at = Some(Utc::now());
    }

    /// Transition to Failed and record the finish time.
    pub fn fail(&mut self, reason: &str) {
        self.state = TaskState::Failed {
            reason: reason.to_string(),
        };
        self.finished_at = Some(Utc::now());
    }

    pub fn skip(&mut self, upstream: &str) {
        self.state = TaskState::Skipped {
            upstream: upstream.to_string(),
        };
    }

    /// Forget any progress; used for tasks a cancelled run never finished.
    pub fn reset(&mut self) {
        self.state = TaskState::Pending;
        self.started_at = None;
        self.finished_at = None;
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        let finished = self.finished_at?;
        (finished - started).to_std().ok()
    }
}
