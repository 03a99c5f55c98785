//! Scheduler for incremental task execution.
//!
//! The Scheduler classifies every task of a graph, then dispatches the stale
//! ones to the worker pool as soon as their dependencies have succeeded,
//! respecting the concurrency bound. It is the only component that writes
//! to the fingerprint store.

use chrono::Utc;
use petgraph::graph::NodeIndex;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DEFAULT_GRACE_PERIOD_SECS;
use crate::core::dag::TaskGraph;
use crate::core::task::{RunId, TaskRun, TaskState};
use crate::error::{Error, Result};
use crate::orchestration::detector::{ChangeDetector, Classification, StaleReason};
use crate::orchestration::pool::{Completion, Job, WorkerEvent, WorkerPool};
use crate::orchestration::report::{RunReport, RunStatus, TaskOutcome};
use crate::state::fingerprint::action_signature;
use crate::state::store::{FingerprintStore, StoreEntry};
use crate::util;

/// Events emitted by the scheduler for task lifecycle changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// A task was handed to a worker.
    TaskStarted { task: String },
    /// A task reached a terminal state during execution.
    TaskFinished { task: String, state: TaskState },
    /// The run is over.
    RunFinished { status: RunStatus },
}

/// Knobs for a single run.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Maximum number of tasks in flight.
    pub jobs: usize,
    /// Treat every task as stale.
    pub force: bool,
    /// Classify only; execute and commit nothing.
    pub dry_run: bool,
    /// How long in-flight tasks may continue after cancellation.
    pub grace_period: Duration,
    /// Timeout for tasks that do not declare their own.
    pub task_timeout: Option<Duration>,
    /// Project root; task paths are relative to it.
    pub root: PathBuf,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            jobs: 1,
            force: false,
            dry_run: false,
            grace_period: Duration::from_secs(DEFAULT_GRACE_PERIOD_SECS),
            task_timeout: None,
            root: PathBuf::from("."),
        }
    }
}

/// Mutable bookkeeping for one run.
struct RunState {
    runs: Vec<TaskRun>,
    classifications: Vec<Classification>,
    /// Dependencies of each task that still have to succeed.
    remaining: Vec<usize>,
    /// Keyed by (layer, declaration index) so dispatch order is fixed.
    ready: BTreeSet<(usize, usize)>,
}

/// Drives a task graph to completion.
pub struct Scheduler {
    graph: Arc<TaskGraph>,
    options: SchedulerOptions,
    events: Option<mpsc::UnboundedSender<SchedulerEvent>>,
}

impl Scheduler {
    pub fn new(graph: Arc<TaskGraph>, options: SchedulerOptions) -> Self {
        Self {
            graph,
            options,
            events: None,
        }
    }

    /// Report lifecycle events on `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    /// Run the graph.
    ///
    /// Task failures are recorded in the report; the returned error is kept
    /// for problems that stop the engine itself.
    pub async fn run(
        &self,
        store: &mut FingerprintStore,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let started = Instant::now();
        let run_id = RunId::new();
        info!(
            "Run {} started: {} tasks, {} jobs",
            run_id.short(),
            self.graph.task_count(),
            self.options.jobs
        );

        let mut state = self.classify(store).await?;

        if self.options.dry_run {
            return Ok(self.finish(run_id, RunStatus::DryRun, &state, started));
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pool = WorkerPool::new(self.options.jobs.max(1), tx);
        let mut deadline: Option<Instant> = None;

        loop {
            if deadline.is_none() && cancel.is_cancelled() {
                deadline = Some(self.begin_cancel(&pool));
            }

            if deadline.is_none() {
                while pool.has_capacity() {
                    let Some((_, i)) = state.ready.pop_first() else {
                        break;
                    };
                    self.dispatch(NodeIndex::new(i), &mut state, &mut pool);
                }
            }

            if pool.active_count() == 0 {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled(), if deadline.is_none() => {
                    deadline = Some(self.begin_cancel(&pool));
                }
                _ = wait_until(deadline) => {
                    let terminated = pool.terminate_all().await;
                    warn!("Grace period over, terminated: {}", terminated.join(", "));
                    while let Ok(event) = rx.try_recv() {
                        self.handle_event(event, &mut state, &mut pool, store);
                    }
                    break;
                }
                Some(event) = rx.recv() => {
                    self.handle_event(event, &mut state, &mut pool, store);
                }
            }
        }

        let status = if deadline.is_some() {
            for run in state.runs.iter_mut().filter(|r| !r.is_terminal()) {
                run.reset();
            }
            RunStatus::Cancelled
        } else if state
            .runs
            .iter()
            .any(|r| matches!(r.state, TaskState::Failed { .. }))
        {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };

        Ok(self.finish(run_id, status, &state, started))
    }

    /// Classify every task and seed the ready queue.
    async fn classify(&self, store: &FingerprintStore) -> Result<RunState> {
        let detector = ChangeDetector::new(self.options.root.clone(), self.options.force);
        let graph = Arc::clone(&self.graph);
        let snapshot = store.clone();
        let classifications =
            util::blocking(move || Ok(detector.classify_graph(&graph, &snapshot))).await?;

        let n = self.graph.task_count();
        let mut state = RunState {
            runs: vec![TaskRun::default(); n],
            remaining: vec![0; n],
            ready: BTreeSet::new(),
            classifications,
        };

        for index in self.graph.node_indices() {
            let i = index.index();
            match &state.classifications[i] {
                Classification::UpToDate => state.runs[i].mark_up_to_date(),
                Classification::Stale(reason) => {
                    state.runs[i].mark_stale(reason.to_string());
                    state.remaining[i] = self
                        .graph
                        .dependencies(index)
                        .into_iter()
                        .filter(|dep| state.classifications[dep.index()].is_stale())
                        .count();
                    if state.remaining[i] == 0 {
                        state.ready.insert((self.graph.layer_of(index), i));
                    }
                }
            }
        }
        debug!(
            "{} of {} tasks stale",
            state.classifications.iter().filter(|c| c.is_stale()).count(),
            n
        );
        Ok(state)
    }

    fn dispatch(&self, index: NodeIndex, state: &mut RunState, pool: &mut WorkerPool) {
        let i = index.index();
        let task = self.graph.task(index);

        if let Classification::Stale(StaleReason::Unreadable { .. }) = &state.classifications[i] {
            let reason = state.runs[i].reason.clone().unwrap_or_default();
            self.fail(index, &reason, state);
            return;
        }

        let job = Job {
            index,
            task: task.clone(),
            root: self.options.root.clone(),
            timeout: task.timeout.or(self.options.task_timeout),
        };
        match pool.spawn(job) {
            Ok(()) => {
                info!("Starting {}", task.name);
                state.runs[i].start();
                self.emit(SchedulerEvent::TaskStarted {
                    task: task.name.clone(),
                });
            }
            Err(e) => self.fail(index, &e.to_string(), state),
        }
    }

    fn handle_event(
        &self,
        event: WorkerEvent,
        state: &mut RunState,
        pool: &mut WorkerPool,
        store: &mut FingerprintStore,
    ) {
        let WorkerEvent::Finished { index, outcome } = event;
        pool.complete(index);

        match outcome {
            Ok(completion) => match self.commit(index, completion, store) {
                Ok(()) => self.succeed(index, state),
                Err(e) => {
                    error!("Cannot record {}: {}", self.graph.task(index).name, e);
                    self.fail(index, &format!("Cannot commit fingerprints: {}", e), state);
                }
            },
            Err(Error::Cancelled) => {
                debug!("{} terminated", self.graph.task(index).name);
                state.runs[index.index()].reset();
            }
            Err(e) => self.fail(index, &e.to_string(), state),
        }
    }

    fn commit(
        &self,
        index: NodeIndex,
        completion: Completion,
        store: &mut FingerprintStore,
    ) -> Result<()> {
        let task = self.graph.task(index);
        let entry = StoreEntry {
            action: action_signature(task)?,
            inputs: completion.inputs,
            outputs: completion.outputs,
            completed_at: Utc::now(),
            exit_status: completion.exit_status,
        };
        store.commit(&task.name, entry)
    }

    /// Mark a committed task Succeeded and release its dependents.
    fn succeed(&self, index: NodeIndex, state: &mut RunState) {
        let name = &self.graph.task(index).name;
        state.runs[index.index()].succeed();
        info!("{} succeeded", name);
        self.emit(SchedulerEvent::TaskFinished {
            task: name.clone(),
            state: TaskState::Succeeded,
        });

        for dependent in self.graph.dependents(index) {
            let d = dependent.index();
            if state.runs[d].state != TaskState::Stale {
                continue;
            }
            state.remaining[d] = state.remaining[d].saturating_sub(1);
            if state.remaining[d] == 0 {
                state.ready.insert((self.graph.layer_of(dependent), d));
            }
        }
    }

    /// Mark a task Failed and skip everything downstream of it.
    fn fail(&self, index: NodeIndex, reason: &str, state: &mut RunState) {
        let name = &self.graph.task(index).name;
        warn!("{} failed: {}", name, reason);
        state.runs[index.index()].fail(reason);
        self.emit(SchedulerEvent::TaskFinished {
            task: name.clone(),
            state: state.runs[index.index()].state.clone(),
        });

        for dependent in self.graph.transitive_dependents(index) {
            let d = dependent.index();
            if state.runs[d].is_terminal() {
                continue;
            }
            state.ready.remove(&(self.graph.layer_of(dependent), d));
            state.runs[d].skip(name);
            self.emit(SchedulerEvent::TaskFinished {
                task: self.graph.task(dependent).name.clone(),
                state: state.runs[d].state.clone(),
            });
        }
    }

    fn begin_cancel(&self, pool: &WorkerPool) -> Instant {
        warn!(
            "Cancellation requested, waiting up to {:?} for {} running tasks",
            self.options.grace_period,
            pool.active_count()
        );
        Instant::now() + self.options.grace_period
    }

    fn finish(
        &self,
        run_id: RunId,
        status: RunStatus,
        state: &RunState,
        started: Instant,
    ) -> RunReport {
        let tasks = self
            .graph
            .node_indices()
            .map(|index| {
                TaskOutcome::from_run(&self.graph.task(index).name, &state.runs[index.index()])
            })
            .collect();
        let report = RunReport {
            run_id,
            status,
            tasks,
            elapsed: started.elapsed(),
        };
        info!("{}", report.summary());
        self.emit(SchedulerEvent::RunFinished { status });
        report
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

/// Resolves at `deadline`, or never when there is none.
async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
