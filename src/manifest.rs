//! Loading task definitions from `kiln.toml`.
//!
//! ```toml
//! [settings]
//! jobs = 4
//!
//! [[task]]
//! name = "compile"
//! command = "cc -c main.c -o main.o"
//! inputs = ["main.c"]
//! outputs = ["main.o"]
//!
//! [[task]]
//! name = "test"
//! exec = ["./run-tests", "--quiet"]
//! deps = ["compile"]
//! ```

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::config::Config;
use crate::core::task::{Action, Task};
use crate::error::{DefinitionError, Error, Result};

/// Default manifest file name, looked up in the project root.
pub const MANIFEST_FILE: &str = "kiln.toml";

#[derive(Debug, Deserialize)]
struct ManifestFile {
    #[serde(default)]
    settings: Config,
    #[serde(default, rename = "task")]
    tasks: Vec<TaskDef>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TaskDef {
    name: String,
    command: Option<String>,
    exec: Option<Vec<String>>,
    #[serde(default)]
    inputs: Vec<PathBuf>,
    #[serde(default)]
    outputs: Vec<PathBuf>,
    #[serde(default)]
    deps: Vec<String>,
    cwd: Option<PathBuf>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    timeout_secs: Option<u64>,
}

impl TaskDef {
    fn into_task(self) -> std::result::Result<Task, DefinitionError> {
        let invalid = |reason: &str| DefinitionError::InvalidAction {
            task: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("task name is empty"));
        }

        let action = match (&self.command, &self.exec) {
            (Some(_), Some(_)) => return Err(invalid("both 'command' and 'exec' are set")),
            (Some(command), None) => Action::Shell {
                command: command.clone(),
            },
            (None, Some(argv)) => match argv.split_first() {
                Some((program, args)) => Action::Exec {
                    program: program.clone(),
                    args: args.to_vec(),
                },
                None => return Err(invalid("'exec' is empty")),
            },
            (None, None) => Action::Noop,
        };

        let timeout = match self.timeout_secs {
            Some(0) => return Err(invalid("'timeout_secs' must be positive")),
            other => other.map(Duration::from_secs),
        };

        Ok(Task {
            name: self.name,
            action,
            inputs: self.inputs,
            outputs: self.outputs,
            deps: self.deps,
            cwd: self.cwd.unwrap_or_else(|| PathBuf::from(".")),
            env: self.env,
            timeout,
        })
    }
}

/// Parsed manifest: engine settings plus tasks in declaration order.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub settings: Config,
    pub tasks: Vec<Task>,
}

impl Manifest {
    /// Parse manifest text.
    pub fn parse(text: &str) -> Result<Self> {
        let file: ManifestFile = toml::from_str(text)?;
        let tasks = file
            .tasks
            .into_iter()
            .map(TaskDef::into_task)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self {
            settings: file.settings,
            tasks,
        })
    }

    /// Read and parse a manifest file.
    pub fn load(path: &Path) -> Result<Self> {
        debug!("Manifest::load path={}", path.display());
        let text = fs::read_to_string(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                Error::Validation(format!("Manifest not found: {}", path.display()))
            }
            _ => Error::Io(e),
        })?;
        let manifest = Self::parse(&text)?;
        debug!("Manifest declares {} tasks", manifest.tasks.len());
        Ok(manifest)
    }
}
