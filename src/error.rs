use std::path::PathBuf;

use thiserror::Error;

/// Problems with the task definitions themselves.
///
/// These are detected while building the graph and abort the run before
/// anything executes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("Task '{0}' is defined multiple times")]
    DuplicateTask(String),

    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("Output '{path}' is declared by both '{first}' and '{second}'")]
    DuplicateOutput {
        path: PathBuf,
        first: String,
        second: String,
    },

    #[error("Task '{task}' has an invalid action: {reason}")]
    InvalidAction { task: String, reason: String },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Definition error: {0}")]
    Definition(#[from] DefinitionError),

    #[error("Dependency cycle detected: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Cannot fingerprint {}: {source}", .path.display())]
    Fingerprint {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Command exited with status {code}{}", stderr_suffix(.stderr))]
    CommandFailed { code: i32, stderr: String },

    #[error("Command terminated by signal")]
    Signalled,

    #[error("Program not found: {0}")]
    ProgramNotFound(String),

    #[error("Declared output not produced: {}", .0.display())]
    OutputNotProduced(PathBuf),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Validation error: {0}")]
    Validation(String),
}

impl Error {
    /// Structural errors that make the whole graph untrustworthy.
    pub fn is_graph_error(&self) -> bool {
        matches!(
            self,
            Error::Definition(_) | Error::Cycle { .. } | Error::TaskNotFound(_)
        )
    }
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {}", trimmed)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
