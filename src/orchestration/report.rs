//! Final per-task report of a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::core::task::{RunId, TaskRun, TaskState};

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILED: i32 = 1;
pub const EXIT_GRAPH_ERROR: i32 = 2;
pub const EXIT_CANCELLED: i32 = 3;

/// Overall result of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
    /// Nothing was executed; stale tasks were only reported.
    DryRun,
}

impl RunStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Succeeded | RunStatus::DryRun => EXIT_SUCCESS,
            RunStatus::Failed => EXIT_FAILED,
            RunStatus::Cancelled => EXIT_CANCELLED,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
            RunStatus::DryRun => write!(f, "dry run"),
        }
    }
}

/// Final state of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub name: String,
    #[serde(flatten)]
    pub state: TaskState,
    /// Why the task was considered stale, if it was.
    #[serde(rename = "stale_reason", skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,
}

impl TaskOutcome {
    pub fn from_run(name: &str, run: &TaskRun) -> Self {
        Self {
            name: name.to_string(),
            state: run.state.clone(),
            reason: run.reason.clone(),
            started_at: run.started_at,
            finished_at: run.finished_at,
            duration: run.duration(),
        }
    }
}

/// Everything a caller needs to know about a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub status: RunStatus,
    /// One entry per task, in declaration order.
    pub tasks: Vec<TaskOutcome>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }

    pub fn outcome(&self, name: &str) -> Option<&TaskOutcome> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn state_of(&self, name: &str) -> Option<&TaskState> {
        self.outcome(name).map(|t| &t.state)
    }

    /// Number of tasks whose state matches the predicate.
    pub fn count(&self, predicate: impl Fn(&TaskState) -> bool) -> usize {
        self.tasks.iter().filter(|t| predicate(&t.state)).count()
    }

    /// Status line for a single task.
    pub fn line(&self, outcome: &TaskOutcome) -> String {
        match (&outcome.state, self.status) {
            (TaskState::Stale, RunStatus::DryRun) => match &outcome.reason {
                Some(reason) => format!("Stale (would run): {}", reason),
                None => "Stale (would run)".to_string(),
            },
            (state, _) => state.to_string(),
        }
    }

    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        let counts = [
            (self.count(|s| *s == TaskState::Succeeded), "succeeded"),
            (self.count(|s| *s == TaskState::UpToDate), "up to date"),
            (self.count(|s| *s == TaskState::Stale), "would run"),
            (self.count(|s| matches!(s, TaskState::Failed { .. })), "failed"),
            (self.count(|s| matches!(s, TaskState::Skipped { .. })), "skipped"),
            (self.count(|s| *s == TaskState::Pending), "pending"),
        ];
        for (n, label) in counts {
            if n > 0 {
                parts.push(format!("{} {}", n, label));
            }
        }
        if parts.is_empty() {
            parts.push("no tasks".to_string());
        }
        format!(
            "Run {} {}: {} in {:.2}s",
            self.run_id.short(),
            self.status,
            parts.join(", "),
            self.elapsed.as_secs_f64()
        )
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self.tasks.iter().map(|t| t.name.len()).max().unwrap_or(0);
        for outcome in &self.tasks {
            writeln!(f, "{:<width$}  {}", outcome.name, self.line(outcome), width = width)?;
        }
        write!(f, "{}", self.summary())
    }
}
