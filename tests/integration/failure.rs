//! Failure isolation tests.
//!
//! These tests verify that a failing task takes down exactly its
//! transitive dependents, that independent work still finishes and that
//! nothing is recorded for tasks that did not succeed.

use kiln::core::{Task, TaskGraph, TaskState};
use kiln::orchestration::{RunStatus, EXIT_GRAPH_ERROR};
use kiln::Error;
use tokio_util::sync::CancellationToken;

use crate::fixtures::{compile_link_project, TestProject};

/// Test: Compile failure
/// Given a compile/link project where compile_a fails
/// When the scheduler runs
/// Then link is skipped, compile_b succeeds and the exit code is 1
#[tokio::test]
async fn test_failure_skips_dependents_and_spares_siblings() {
    let (project, mut tasks) = compile_link_project();
    tasks[0] = Task::shell("compile_a", "echo 'a.c:1: syntax error' >&2; exit 2")
        .with_inputs(&["a.c"])
        .with_outputs(&["a.o"]);

    let report = project.run(tasks).await;

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.exit_code(), 1);
    match report.state_of("compile_a") {
        Some(TaskState::Failed { reason }) => {
            assert!(reason.contains("status 2"), "{}", reason);
            assert!(reason.contains("syntax error"), "{}", reason);
        }
        other => panic!("Expected Failed, got {:?}", other),
    }
    assert_eq!(
        report.state_of("link"),
        Some(&TaskState::Skipped {
            upstream: "compile_a".to_string()
        })
    );
    assert_eq!(report.state_of("compile_b"), Some(&TaskState::Succeeded));

    let store = project.store();
    assert!(store.get("compile_a").is_none());
    assert!(store.get("link").is_none());
    assert!(store.get("compile_b").is_some());
}

/// Test: Failure is retried
/// Given a task that failed last time
/// When nothing changed and the scheduler runs again
/// Then the task runs again because no success was recorded
#[tokio::test]
async fn test_failed_task_runs_again() {
    let project = TestProject::new();
    project.write("flag", "fail");
    let task = Task::shell("check", "test \"$(cat flag)\" = ok").with_inputs(&["flag"]);

    let first = project.run(vec![task.clone()]).await;
    assert!(matches!(first.state_of("check"), Some(TaskState::Failed { .. })));

    let second = project.run(vec![task.clone()]).await;
    assert!(matches!(second.state_of("check"), Some(TaskState::Failed { .. })));

    project.write("flag", "ok");
    let third = project.run(vec![task]).await;
    assert_eq!(third.state_of("check"), Some(&TaskState::Succeeded));
}

/// Test: Missing declared output
/// Given a task whose command succeeds without writing its output
/// When the scheduler runs
/// Then the task fails and no entry is committed
#[tokio::test]
async fn test_missing_output_is_failure() {
    let project = TestProject::new();
    let task = Task::shell("forgetful", "true").with_outputs(&["result.txt"]);

    let report = project.run(vec![task]).await;

    match report.state_of("forgetful") {
        Some(TaskState::Failed { reason }) => {
            assert!(reason.starts_with("Declared output not produced"), "{}", reason)
        }
        other => panic!("Expected Failed, got {:?}", other),
    }
    assert!(project.store().is_empty());
}

/// Test: Skip propagates transitively
/// Given a chain a -> b -> c and an independent d
/// When a fails
/// Then b and c are skipped naming a, and d still succeeds
#[tokio::test]
async fn test_skip_is_transitive() {
    let project = TestProject::new();
    let tasks = vec![
        Task::shell("a", "exit 1"),
        Task::new("b").with_deps(&["a"]),
        Task::new("c").with_deps(&["b"]),
        Task::new("d"),
    ];

    let report = project.run(tasks).await;

    let skipped = TaskState::Skipped {
        upstream: "a".to_string(),
    };
    assert_eq!(report.state_of("b"), Some(&skipped));
    assert_eq!(report.state_of("c"), Some(&skipped));
    assert_eq!(report.state_of("d"), Some(&TaskState::Succeeded));
    assert!(report.to_string().contains("Skipped: a"));
}

/// Test: Cycle rejected before execution
/// Given tasks that depend on each other in a loop
/// When the graph is built
/// Then a cycle error naming the loop is returned and maps to exit code 2
#[test]
fn test_cycle_is_graph_error() {
    let tasks = vec![
        Task::new("a").with_deps(&["c"]),
        Task::new("b").with_deps(&["a"]),
        Task::new("c").with_deps(&["b"]),
    ];

    let err = TaskGraph::build(tasks).unwrap_err();

    assert!(err.is_graph_error());
    assert!(matches!(err, Error::Cycle { ref path } if path.len() == 4));
    assert!(err.to_string().contains(" -> "));
    assert_eq!(EXIT_GRAPH_ERROR, 2);
}

/// Test: Unrecorded success is not resurrected
/// Given a store location that is blocked when the first task commits
/// When a later task clears the blockage and commits successfully
/// Then the first task is reported failed, left out of the store and
///      runs again next time
#[tokio::test]
async fn test_failed_commit_is_not_recorded_by_later_commit() {
    let project = TestProject::new();
    project.write(".kiln", "not a directory");
    let tasks = vec![
        Task::shell("a", "true"),
        Task::shell("b", "rm .kiln && mkdir .kiln"),
    ];

    let (first, _) = project
        .run_with(tasks.clone(), project.options(1), CancellationToken::new())
        .await;

    match first.state_of("a") {
        Some(TaskState::Failed { reason }) => {
            assert!(reason.starts_with("Cannot commit fingerprints"), "{}", reason)
        }
        other => panic!("Expected Failed, got {:?}", other),
    }
    assert_eq!(first.state_of("b"), Some(&TaskState::Succeeded));

    let store = project.store();
    assert!(store.get("a").is_none());
    assert!(store.get("b").is_some());

    let second = project.run(tasks).await;
    assert_eq!(second.state_of("a"), Some(&TaskState::Succeeded));
    assert_eq!(second.state_of("b"), Some(&TaskState::UpToDate));
}
