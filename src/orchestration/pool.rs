//! Worker pool for task execution.
//!
//! The `WorkerPool` runs task actions concurrently, enforcing the
//! concurrency bound and reporting every finished job over a channel. A
//! worker snapshots the task's inputs, runs the action and snapshots the
//! outputs. It never touches the fingerprint store; committing is left to
//! the scheduler.

use petgraph::graph::NodeIndex;
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::task::{Action, Task};
use crate::error::{Error, Result};
use crate::state::fingerprint::{snapshot, FileSnapshot};
use crate::util;

/// How much trailing stderr ends up in a failure reason.
const STDERR_TAIL_BYTES: usize = 2048;

/// A unit of work handed to the pool.
#[derive(Debug, Clone)]
pub struct Job {
    /// Node of the task in the graph.
    pub index: NodeIndex,
    pub task: Task,
    /// Project root; task paths are relative to it.
    pub root: PathBuf,
    /// Effective timeout for the action.
    pub timeout: Option<Duration>,
}

/// What a successful worker hands back for committing.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// Inputs as observed right before the action started.
    pub inputs: FileSnapshot,
    /// Outputs as observed right after the action finished.
    pub outputs: FileSnapshot,
    pub exit_status: i32,
}

/// Events emitted by the pool.
#[derive(Debug)]
pub enum WorkerEvent {
    /// A worker finished, one way or another.
    Finished {
        index: NodeIndex,
        outcome: Result<Completion>,
    },
}

struct Worker {
    name: String,
    handle: JoinHandle<()>,
}

/// Runs jobs on the tokio runtime, at most `max_concurrent` at a time.
///
/// # Example
///
/// ```ignore
/// use tokio::sync::mpsc;
/// use kiln::orchestration::WorkerPool;
///
/// let (tx, mut rx) = mpsc::unbounded_channel();
/// let mut pool = WorkerPool::new(4, tx);
///
/// assert!(pool.has_capacity());
/// assert_eq!(pool.active_count(), 0);
/// ```
pub struct WorkerPool {
    workers: HashMap<NodeIndex, Worker>,
    max_concurrent: usize,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
    /// Parent of every worker's token; cancelled by `terminate_all`.
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn new(max_concurrent: usize, event_tx: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        Self {
            workers: HashMap::new(),
            max_concurrent,
            event_tx,
            shutdown: CancellationToken::new(),
        }
    }

    /// Start a job.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the pool is full or the task is
    /// already running.
    pub fn spawn(&mut self, job: Job) -> Result<()> {
        if !self.has_capacity() {
            return Err(Error::Validation(format!(
                "Worker pool is full ({} workers)",
                self.max_concurrent
            )));
        }
        if self.workers.contains_key(&job.index) {
            return Err(Error::Validation(format!(
                "Task '{}' is already running",
                job.task.name
            )));
        }

        let index = job.index;
        let name = job.task.name.clone();
        let token = self.shutdown.child_token();
        let tx = self.event_tx.clone();

        debug!("Spawning worker for {}", name);
        let handle = tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = token.cancelled() => Err(Error::Cancelled),
                outcome = run_job(job) => outcome,
            };
            // The receiver only goes away once the scheduler has given up
            let _ = tx.send(WorkerEvent::Finished { index, outcome });
        });

        self.workers.insert(index, Worker { name, handle });
        Ok(())
    }

    /// Forget a worker whose `Finished` event has been received.
    pub fn complete(&mut self, index: NodeIndex) {
        self.workers.remove(&index);
    }

    /// Kill every running action and wait for the workers to wind down.
    ///
    /// Each terminated worker still reports `Finished` with
    /// `Error::Cancelled`. Returns the names of the terminated tasks.
    pub async fn terminate_all(&mut self) -> Vec<String> {
        self.shutdown.cancel();
        let mut names = Vec::new();
        for (_, worker) in self.workers.drain() {
            if let Err(e) = worker.handle.await {
                warn!("Worker for {} ended abnormally: {}", worker.name, e);
            }
            names.push(worker.name);
        }
        names.sort();
        names
    }

    pub fn is_running(&self, index: NodeIndex) -> bool {
        self.workers.contains_key(&index)
    }

    pub fn active_count(&self) -> usize {
        self.workers.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.active_count() < self.max_concurrent
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

async fn run_job(job: Job) -> Result<Completion> {
    let root = job.root.clone();
    let declared = job.task.inputs.clone();
    let inputs = util::blocking(move || snapshot(&root, &declared)).await?;

    let exit_status = execute(&job.task, &job.root, job.timeout).await?;

    let root = job.root.clone();
    let declared = job.task.outputs.clone();
    let outputs = util::blocking(move || snapshot(&root, &declared)).await?;
    if let Some((path, _)) = outputs.iter().find(|(_, fp)| fp.is_none()) {
        return Err(Error::OutputNotProduced(path.clone()));
    }

    Ok(Completion {
        inputs,
        outputs,
        exit_status,
    })
}

/// Run a task's action to completion and return its exit status.
///
/// Dropping the returned future kills the child process.
pub async fn execute(task: &Task, root: &Path, timeout: Option<Duration>) -> Result<i32> {
    let Some(mut command) = build_command(task, root)? else {
        return Ok(0);
    };

    let output = match timeout {
        Some(limit) => tokio::time::timeout(limit, command.output())
            .await
            .map_err(|_| Error::Timeout(limit))??,
        None => command.output().await?,
    };

    if !output.stdout.is_empty() {
        debug!(
            "{} stdout: {}",
            task.name,
            String::from_utf8_lossy(&output.stdout).trim_end()
        );
    }

    match output.status.code() {
        Some(0) => Ok(0),
        Some(code) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(Error::CommandFailed {
                code,
                stderr: util::tail(stderr.trim(), STDERR_TAIL_BYTES).to_string(),
            })
        }
        None => Err(Error::Signalled),
    }
}

/// Build the process for a task, or `None` for a no-op.
fn build_command(task: &Task, root: &Path) -> Result<Option<Command>> {
    let cwd = root.join(&task.cwd);
    let mut command = match &task.action {
        Action::Noop => return Ok(None),
        Action::Shell { command } => shell_command(command),
        Action::Exec { program, args } => {
            let resolved = resolve_program(program, &cwd)?;
            let mut cmd = Command::new(resolved);
            cmd.args(args);
            cmd
        }
    };

    command
        .current_dir(&cwd)
        .envs(&task.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    Ok(Some(command))
}

#[cfg(unix)]
fn shell_command(line: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(line);
    cmd
}

#[cfg(windows)]
fn shell_command(line: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(line);
    cmd
}

fn resolve_program(program: &str, cwd: &Path) -> Result<PathBuf> {
    let path: Option<OsString> = std::env::var_os("PATH");
    which::which_in(program, path, cwd).map_err(|_| Error::ProgramNotFound(program.to_string()))
}
