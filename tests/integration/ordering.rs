//! Ordering and concurrency tests.
//!
//! These tests verify that no task starts before its dependencies have
//! finished and that the number of tasks in flight never exceeds the bound.

use kiln::core::{Task, TaskState};
use kiln::orchestration::{RunStatus, SchedulerEvent};
use tokio_util::sync::CancellationToken;

use crate::fixtures::{logging_tasks, max_in_flight, position, started_order, TestProject};

/// Test: Dependencies finish first
/// Given a diamond a -> (b, c) -> d
/// When the scheduler runs with plenty of workers
/// Then b and c start after a finished, and d after both
#[tokio::test]
async fn test_dependents_start_after_dependencies_finish() {
    let project = TestProject::new();
    let tasks = vec![
        Task::shell("a", "sleep 0.1"),
        Task::shell("b", "sleep 0.1").with_deps(&["a"]),
        Task::shell("c", "sleep 0.1").with_deps(&["a"]),
        Task::new("d").with_deps(&["b", "c"]),
    ];

    let (report, events) = project
        .run_with(tasks, project.options(8), CancellationToken::new())
        .await;
    assert_eq!(report.status, RunStatus::Succeeded);

    let finished = |name: &str| {
        let name = name.to_string();
        position(&events, move |e| {
            matches!(e, SchedulerEvent::TaskFinished { task, .. } if *task == name)
        })
    };
    let started = |name: &str| {
        let name = name.to_string();
        position(&events, move |e| {
            matches!(e, SchedulerEvent::TaskStarted { task } if *task == name)
        })
    };

    assert!(started("b") > finished("a"));
    assert!(started("c") > finished("a"));
    assert!(started("d") > finished("b"));
    assert!(started("d") > finished("c"));
}

/// Test: Implicit edges order execution
/// Given a consumer declared before its producer, linked only by a path
/// When the scheduler runs
/// Then the producer runs first and the consumer sees its output
#[tokio::test]
async fn test_path_overlap_orders_tasks() {
    let project = TestProject::new();
    let tasks = vec![
        Task::shell("consume", "cp gen/data.txt copy.txt")
            .with_inputs(&["gen/data.txt"])
            .with_outputs(&["copy.txt"]),
        Task::shell("produce", "mkdir -p gen && echo data > gen/data.txt")
            .with_outputs(&["gen"]),
    ];

    let (report, events) = project
        .run_with(tasks, project.options(4), CancellationToken::new())
        .await;

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(started_order(&events), vec!["produce", "consume"]);
    assert_eq!(project.read("copy.txt"), "data\n");
}

/// Test: Concurrency bound
/// Given six independent tasks and a bound of two
/// When the scheduler runs
/// Then at most two are ever in flight
#[tokio::test]
async fn test_concurrency_bound_is_respected() {
    let project = TestProject::new();

    let (report, _) = project
        .run_with(
            logging_tasks(6, "0.2"),
            project.options(2),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(report.status, RunStatus::Succeeded);
    let log = project.read("events.log");
    assert_eq!(log.lines().count(), 12);
    assert!(max_in_flight(&log) <= 2, "log was:\n{}", log);
}

/// Test: Independent tasks run in parallel
/// Given four independent tasks and a bound of four
/// When the scheduler runs
/// Then more than one is in flight at some point
#[tokio::test]
async fn test_independent_tasks_overlap() {
    let project = TestProject::new();

    let (report, _) = project
        .run_with(
            logging_tasks(4, "0.5"),
            project.options(4),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(report.status, RunStatus::Succeeded);
    assert!(max_in_flight(&project.read("events.log")) > 1);
}

/// Test: Deterministic dispatch
/// Given independent tasks in one layer and a single worker
/// When the scheduler runs
/// Then they start in declaration order
#[tokio::test]
async fn test_single_worker_follows_declaration_order() {
    let project = TestProject::new();
    let tasks = vec![Task::new("zeta"), Task::new("alpha"), Task::new("mid")];

    let (report, events) = project
        .run_with(tasks, project.options(1), CancellationToken::new())
        .await;

    assert!(report.tasks.iter().all(|t| t.state == TaskState::Succeeded));
    assert_eq!(started_order(&events), vec!["zeta", "alpha", "mid"]);
}
