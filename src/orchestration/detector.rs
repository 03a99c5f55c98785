//! Change detection.
//!
//! Decides whether a task has to run by comparing what is on disk now with
//! the store entry from its last success.

use petgraph::graph::NodeIndex;
use std::path::{Path, PathBuf};

use crate::core::dag::TaskGraph;
use crate::core::task::Task;
use crate::state::fingerprint::{action_signature, snapshot, FileSnapshot};
use crate::state::store::{FingerprintStore, StoreEntry};
use crate::Error;

/// Why a task has to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    /// Force mode is on.
    Forced,
    /// No successful run on record.
    NoEntry,
    /// Command, arguments, working directory or environment changed.
    ActionChanged,
    /// A dependency runs in this invocation.
    UpstreamStale { task: String },
    InputChanged { path: PathBuf },
    InputAdded { path: PathBuf },
    InputRemoved { path: PathBuf },
    OutputMissing { path: PathBuf },
    OutputChanged { path: PathBuf },
    /// Something could not be fingerprinted. The task fails instead of running.
    Unreadable { path: PathBuf, error: String },
}

impl std::fmt::Display for StaleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StaleReason::Forced => write!(f, "forced"),
            StaleReason::NoEntry => write!(f, "no previous successful run"),
            StaleReason::ActionChanged => write!(f, "action changed"),
            StaleReason::UpstreamStale { task } => write!(f, "dependency '{}' is stale", task),
            StaleReason::InputChanged { path } => write!(f, "input changed: {}", path.display()),
            StaleReason::InputAdded { path } => write!(f, "input appeared: {}", path.display()),
            StaleReason::InputRemoved { path } => write!(f, "input removed: {}", path.display()),
            StaleReason::OutputMissing { path } => write!(f, "output missing: {}", path.display()),
            StaleReason::OutputChanged { path } => write!(f, "output changed: {}", path.display()),
            StaleReason::Unreadable { path, error } => {
                write!(f, "cannot fingerprint {}: {}", path.display(), error)
            }
        }
    }
}

/// Result of classifying one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    UpToDate,
    Stale(StaleReason),
}

impl Classification {
    pub fn is_stale(&self) -> bool {
        matches!(self, Classification::Stale(_))
    }
}

/// Classifies tasks against the fingerprint store.
///
/// Holds no state besides its inputs: classifying the same task twice gives
/// the same answer as long as the filesystem and the store are unchanged.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    root: PathBuf,
    force: bool,
}

impl ChangeDetector {
    pub fn new(root: impl Into<PathBuf>, force: bool) -> Self {
        Self {
            root: root.into(),
            force,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Classify a single task.
    ///
    /// `upstream` names a dependency that is stale or runs in this
    /// invocation, if any.
    pub fn classify(
        &self,
        task: &Task,
        entry: Option<&StoreEntry>,
        upstream: Option<&str>,
    ) -> Classification {
        if self.force {
            return Classification::Stale(StaleReason::Forced);
        }

        let Some(entry) = entry else {
            return Classification::Stale(StaleReason::NoEntry);
        };

        match action_signature(task) {
            Ok(signature) if signature == entry.action => {}
            Ok(_) => return Classification::Stale(StaleReason::ActionChanged),
            Err(e) => {
                return Classification::Stale(StaleReason::Unreadable {
                    path: task.cwd.clone(),
                    error: e.to_string(),
                })
            }
        }

        if let Some(dependency) = upstream {
            return Classification::Stale(StaleReason::UpstreamStale {
                task: dependency.to_string(),
            });
        }

        let inputs = match snapshot(&self.root, &task.inputs) {
            Ok(inputs) => inputs,
            Err(e) => return unreadable(e),
        };
        if let Some(reason) = compare_inputs(&entry.inputs, &inputs) {
            return Classification::Stale(reason);
        }

        let outputs = match snapshot(&self.root, &task.outputs) {
            Ok(outputs) => outputs,
            Err(e) => return unreadable(e),
        };
        if let Some(reason) = compare_outputs(&entry.outputs, &outputs) {
            return Classification::Stale(reason);
        }

        Classification::UpToDate
    }

    /// Classify every task of a graph in topological order.
    ///
    /// A task with a stale dependency is stale itself, so staleness spreads
    /// to exactly the tasks reachable from a changed one. The result is
    /// indexed by `NodeIndex::index()`.
    pub fn classify_graph(
        &self,
        graph: &TaskGraph,
        store: &FingerprintStore,
    ) -> Vec<Classification> {
        let mut result = vec![Classification::UpToDate; graph.task_count()];
        for index in graph.topological_order() {
            let task = graph.task(index);
            let upstream = first_stale_dependency(graph, &result, index);
            let classification = self.classify(task, store.get(&task.name), upstream);
            if let Classification::Stale(reason) = &classification {
                tracing::debug!("{} is stale: {}", task.name, reason);
            }
            result[index.index()] = classification;
        }
        result
    }
}

fn first_stale_dependency<'g>(
    graph: &'g TaskGraph,
    classified: &[Classification],
    index: NodeIndex,
) -> Option<&'g str> {
    graph
        .dependencies(index)
        .into_iter()
        .find(|dep| classified[dep.index()].is_stale())
        .map(|dep| graph.task(dep).name.as_str())
}

fn unreadable(error: Error) -> Classification {
    let path = match &error {
        Error::Fingerprint { path, .. } => path.clone(),
        _ => PathBuf::new(),
    };
    Classification::Stale(StaleReason::Unreadable {
        path,
        error: error.to_string(),
    })
}

/// First difference between recorded and current inputs, in path order.
fn compare_inputs(recorded: &FileSnapshot, current: &FileSnapshot) -> Option<StaleReason> {
    let mut paths: Vec<&PathBuf> = recorded.keys().chain(current.keys()).collect();
    paths.sort();
    paths.dedup();

    for path in paths {
        let before = recorded.get(path).cloned().flatten();
        let now = current.get(path).cloned().flatten();
        match (before, now) {
            (Some(a), Some(b)) if a != b => {
                return Some(StaleReason::InputChanged { path: path.clone() })
            }
            (None, Some(_)) => return Some(StaleReason::InputAdded { path: path.clone() }),
            (Some(_), None) => return Some(StaleReason::InputRemoved { path: path.clone() }),
            _ => {}
        }
    }
    None
}

/// First declared output that is missing or differs from what was produced.
fn compare_outputs(recorded: &FileSnapshot, current: &FileSnapshot) -> Option<StaleReason> {
    for (path, now) in current {
        match (recorded.get(path), now) {
            (_, None) => return Some(StaleReason::OutputMissing { path: path.clone() }),
            (Some(Some(before)), Some(now)) if before == now => {}
            _ => return Some(StaleReason::OutputChanged { path: path.clone() }),
        }
    }
    // Files recorded under an output directory that have since vanished
    recorded
        .keys()
        .find(|path| !current.contains_key(*path))
        .map(|path| StaleReason::OutputMissing { path: path.clone() })
}
