//! Task graph for dependency management.
//!
//! This module provides the TaskGraph structure that holds the tasks of one
//! run as a directed acyclic graph. An edge `a -> b` means `a` must finish
//! successfully before `b` may start.

use crate::core::task::Task;
use crate::error::{DefinitionError, Error, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

/// Why an edge exists between two tasks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum EdgeKind {
    /// Listed in the dependent's `deps`.
    Declared,
    /// The dependent reads a path the dependency declares as output.
    Produces {
        /// The input path of the dependent that the dependency produces.
        path: PathBuf,
    },
}

impl Default for EdgeKind {
    fn default() -> Self {
        Self::Declared
    }
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EdgeKind::Declared => write!(f, "declared"),
            EdgeKind::Produces { path } => write!(f, "produces: {}", path.display()),
        }
    }
}

/// The validated task graph.
///
/// Node indices follow declaration order, so `index.index()` doubles as a
/// stable tie-breaker wherever the engine needs a deterministic order.
pub struct TaskGraph {
    /// The underlying directed graph.
    graph: DiGraph<Task, EdgeKind>,
    /// Index mapping from task name to NodeIndex for fast lookups.
    task_index: HashMap<String, NodeIndex>,
    /// Topological layers, each in declaration order.
    layers: Vec<Vec<NodeIndex>>,
    /// Layer number of each node, indexed by `NodeIndex::index()`.
    layer_of: Vec<usize>,
}

impl TaskGraph {
    /// Build a graph from task definitions.
    ///
    /// Resolves declared dependencies and implicit output-to-input edges,
    /// then rejects the result if it contains a cycle.
    ///
    /// # Errors
    /// - `DefinitionError::DuplicateTask` if two tasks share a name
    /// - `DefinitionError::DuplicateOutput` if two tasks declare the same output
    /// - `DefinitionError::UnknownDependency` if a dependency names no task
    /// - `Error::Cycle` with the full cycle if the graph is not acyclic
    pub fn build(tasks: Vec<Task>) -> Result<Self> {
        let mut graph: DiGraph<Task, EdgeKind> = DiGraph::new();
        let mut task_index = HashMap::new();

        for task in tasks {
            let task = task.normalized();
            if task_index.contains_key(&task.name) {
                return Err(DefinitionError::DuplicateTask(task.name).into());
            }
            let name = task.name.clone();
            let index = graph.add_node(task);
            task_index.insert(name, index);
        }

        let producers = collect_producers(&graph)?;

        let mut edges = Vec::new();
        for index in graph.node_indices() {
            let task = &graph[index];
            for dep in &task.deps {
                let dep_index =
                    task_index
                        .get(dep)
                        .ok_or_else(|| DefinitionError::UnknownDependency {
                            task: task.name.clone(),
                            dependency: dep.clone(),
                        })?;
                edges.push((*dep_index, index, EdgeKind::Declared));
            }
            for input in &task.inputs {
                if let Some(producer) = find_producer(&producers, input) {
                    // A task reading back its own output is not an ordering constraint
                    if producer != index {
                        edges.push((
                            producer,
                            index,
                            EdgeKind::Produces {
                                path: input.clone(),
                            },
                        ));
                    }
                }
            }
        }

        // Declared edges come first per task, so they win over implicit ones
        for (from, to, kind) in edges {
            if graph.find_edge(from, to).is_none() {
                graph.add_edge(from, to, kind);
            }
        }

        if let Some(path) = find_cycle(&graph) {
            return Err(Error::Cycle { path });
        }

        let (layers, layer_of) = compute_layers(&graph);
        tracing::debug!(
            tasks = graph.node_count(),
            edges = graph.edge_count(),
            layers = layers.len(),
            "Task graph built"
        );

        Ok(Self {
            graph,
            task_index,
            layers,
            layer_of,
        })
    }

    /// Get a task by index.
    ///
    /// # Panics
    /// Panics if the index does not belong to this graph.
    pub fn task(&self, index: NodeIndex) -> &Task {
        &self.graph[index]
    }

    /// Get a task by name.
    pub fn get_task(&self, name: &str) -> Option<&Task> {
        self.index_of(name).map(|index| &self.graph[index])
    }

    /// Get the NodeIndex for a task by name.
    pub fn index_of(&self, name: &str) -> Option<NodeIndex> {
        self.task_index.get(name).copied()
    }

    /// Get the number of tasks in the graph.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of dependency edges in the graph.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains_task(&self, name: &str) -> bool {
        self.task_index.contains_key(name)
    }

    /// All node indices in declaration order.
    pub fn node_indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    /// All tasks in declaration order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.node_weights()
    }

    /// Why `to` depends on `from`, if it does.
    pub fn edge_kind(&self, from: &str, to: &str) -> Option<&EdgeKind> {
        let edge = self.graph.find_edge(self.index_of(from)?, self.index_of(to)?)?;
        self.graph.edge_weight(edge)
    }

    /// Direct dependencies of a task, in declaration order.
    pub fn dependencies(&self, index: NodeIndex) -> Vec<NodeIndex> {
        sorted_neighbors(&self.graph, index, Direction::Incoming)
    }

    /// Direct dependents of a task, in declaration order.
    pub fn dependents(&self, index: NodeIndex) -> Vec<NodeIndex> {
        sorted_neighbors(&self.graph, index, Direction::Outgoing)
    }

    /// Every task reachable from `index` along dependent edges, excluding
    /// `index` itself, in declaration order.
    pub fn transitive_dependents(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([index]);
        while let Some(current) = queue.pop_front() {
            for next in self.graph.neighbors_directed(current, Direction::Outgoing) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        let mut result: Vec<NodeIndex> = seen.into_iter().collect();
        result.sort();
        result
    }

    /// Layers of mutually independent tasks.
    ///
    /// Layer *k* holds exactly the tasks whose dependencies all sit in layers
    /// before *k*. This is the maximal-parallelism partial order.
    pub fn layers(&self) -> &[Vec<NodeIndex>] {
        &self.layers
    }

    /// Same as [`layers`](Self::layers), with task names.
    pub fn topological_layers(&self) -> Vec<Vec<&str>> {
        self.layers
            .iter()
            .map(|layer| {
                layer
                    .iter()
                    .map(|&index| self.graph[index].name.as_str())
                    .collect()
            })
            .collect()
    }

    /// Layer number of a task.
    pub fn layer_of(&self, index: NodeIndex) -> usize {
        self.layer_of[index.index()]
    }

    /// Tasks in an order where every task follows all of its dependencies.
    pub fn topological_order(&self) -> Vec<NodeIndex> {
        self.layers.iter().flatten().copied().collect()
    }

    /// Restrict the graph to the named tasks and their transitive
    /// dependencies.
    ///
    /// # Errors
    /// Returns `Error::TaskNotFound` if a name is unknown.
    pub fn subgraph_reachable_from<S: AsRef<str>>(&self, names: &[S]) -> Result<TaskGraph> {
        let mut keep = HashSet::new();
        let mut stack = Vec::new();
        for name in names {
            let name = name.as_ref();
            let index = self
                .index_of(name)
                .ok_or_else(|| Error::TaskNotFound(name.to_string()))?;
            stack.push(index);
        }

        while let Some(index) = stack.pop() {
            if keep.insert(index) {
                stack.extend(self.graph.neighbors_directed(index, Direction::Incoming));
            }
        }

        let tasks = self
            .graph
            .node_indices()
            .filter(|index| keep.contains(index))
            .map(|index| self.graph[index].clone())
            .collect();

        TaskGraph::build(tasks)
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .field("layers", &self.layers.len())
            .finish()
    }
}

fn collect_producers(graph: &DiGraph<Task, EdgeKind>) -> Result<HashMap<PathBuf, NodeIndex>> {
    let mut producers: HashMap<PathBuf, NodeIndex> = HashMap::new();
    for index in graph.node_indices() {
        for output in &graph[index].outputs {
            match producers.get(output).copied() {
                Some(first) if first != index => {
                    return Err(DefinitionError::DuplicateOutput {
                        path: output.clone(),
                        first: graph[first].name.clone(),
                        second: graph[index].name.clone(),
                    }
                    .into());
                }
                Some(_) => {}
                None => {
                    producers.insert(output.clone(), index);
                }
            }
        }
    }
    Ok(producers)
}

/// Find the task whose declared output is `input` or a directory holding it.
fn find_producer(producers: &HashMap<PathBuf, NodeIndex>, input: &Path) -> Option<NodeIndex> {
    input
        .ancestors()
        .filter(|p| !p.as_os_str().is_empty())
        .find_map(|p| producers.get(p).copied())
}

fn sorted_neighbors(
    graph: &DiGraph<Task, EdgeKind>,
    index: NodeIndex,
    direction: Direction,
) -> Vec<NodeIndex> {
    let mut neighbors: Vec<NodeIndex> = graph.neighbors_directed(index, direction).collect();
    neighbors.sort();
    neighbors.dedup();
    neighbors
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Unvisited,
    InProgress,
    Done,
}

/// Three-color depth-first search along "depends on" edges.
///
/// Returns the first cycle found as task names, with the first name repeated
/// at the end (`a -> b -> a`).
fn find_cycle(graph: &DiGraph<Task, EdgeKind>) -> Option<Vec<String>> {
    let mut color = vec![Color::Unvisited; graph.node_count()];

    for start in graph.node_indices() {
        if color[start.index()] != Color::Unvisited {
            continue;
        }

        // (node, its dependencies, next dependency to visit)
        let mut stack: Vec<(NodeIndex, Vec<NodeIndex>, usize)> = Vec::new();
        color[start.index()] = Color::InProgress;
        stack.push((start, sorted_neighbors(graph, start, Direction::Incoming), 0));

        while let Some(top) = stack.last_mut() {
            let node = top.0;
            let next = top.1.get(top.2).copied();
            top.2 += 1;

            let Some(child) = next else {
                color[node.index()] = Color::Done;
                stack.pop();
                continue;
            };

            match color[child.index()] {
                Color::Unvisited => {
                    color[child.index()] = Color::InProgress;
                    stack.push((child, sorted_neighbors(graph, child, Direction::Incoming), 0));
                }
                Color::InProgress => {
                    let from = stack
                        .iter()
                        .position(|(n, _, _)| *n == child)
                        .unwrap_or(0);
                    let mut path: Vec<String> = stack[from..]
                        .iter()
                        .map(|(n, _, _)| graph[*n].name.clone())
                        .collect();
                    path.push(graph[child].name.clone());
                    return Some(path);
                }
                Color::Done => {}
            }
        }
    }

    None
}

fn compute_layers(graph: &DiGraph<Task, EdgeKind>) -> (Vec<Vec<NodeIndex>>, Vec<usize>) {
    let mut remaining: Vec<usize> = graph
        .node_indices()
        .map(|index| graph.neighbors_directed(index, Direction::Incoming).count())
        .collect();
    let mut layer_of = vec![0; graph.node_count()];
    let mut layers = Vec::new();

    let mut current: Vec<NodeIndex> = graph
        .node_indices()
        .filter(|index| remaining[index.index()] == 0)
        .collect();

    while !current.is_empty() {
        let mut next = Vec::new();
        for &index in &current {
            layer_of[index.index()] = layers.len();
            for dependent in graph.neighbors_directed(index, Direction::Outgoing) {
                remaining[dependent.index()] -= 1;
                if remaining[dependent.index()] == 0 {
                    next.push(dependent);
                }
            }
        }
        next.sort();
        layers.push(current);
        current = next;
    }

    (layers, layer_of)
}
