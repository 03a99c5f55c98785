//! Cancellation tests.
//!
//! These tests verify that a cancelled run stops dispatching, lets running
//! tasks finish within the grace period, kills them afterwards and leaves a
//! store that only describes completed work.

use std::time::{Duration, Instant};

use kiln::core::{Task, TaskState};
use kiln::orchestration::RunStatus;
use tokio_util::sync::CancellationToken;

use crate::fixtures::{started_order, TestProject};

fn cancel_after(token: &CancellationToken, delay: Duration) {
    let token = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        token.cancel();
    });
}

/// Test: Cancel a long task
/// Given a task that sleeps far longer than the grace period
/// When the run is cancelled
/// Then the task is killed, reported Pending and not committed
#[tokio::test]
async fn test_cancel_kills_task_after_grace_period() {
    let project = TestProject::new();
    let tasks = vec![
        Task::shell("slow", "sleep 10; touch slow.done"),
        Task::new("after").with_deps(&["slow"]),
    ];
    let cancel = CancellationToken::new();
    cancel_after(&cancel, Duration::from_millis(200));

    let started = Instant::now();
    let (report, events) = project
        .run_with(tasks, project.options(2), cancel)
        .await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.exit_code(), 3);
    assert_eq!(report.state_of("slow"), Some(&TaskState::Pending));
    assert_eq!(report.state_of("after"), Some(&TaskState::Pending));
    assert_eq!(started_order(&events), vec!["slow"]);
    assert!(!project.exists("slow.done"));
    assert!(project.store().is_empty());
}

/// Test: Grace period lets work finish
/// Given a short task, a dependent and a generous grace period
/// When the run is cancelled while the short task runs
/// Then the short task still commits and its dependent is never started
#[tokio::test]
async fn test_task_finishing_within_grace_period_commits() {
    let project = TestProject::new();
    let tasks = vec![
        Task::shell("quick", "sleep 0.4; echo done > quick.txt").with_outputs(&["quick.txt"]),
        Task::shell("next", "touch next.txt").with_deps(&["quick"]),
    ];
    let mut options = project.options(2);
    options.grace_period = Duration::from_secs(5);
    let cancel = CancellationToken::new();
    cancel_after(&cancel, Duration::from_millis(100));

    let (report, events) = project.run_with(tasks.clone(), options, cancel).await;

    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.state_of("quick"), Some(&TaskState::Succeeded));
    assert_eq!(report.state_of("next"), Some(&TaskState::Pending));
    assert_eq!(started_order(&events), vec!["quick"]);
    assert!(!project.exists("next.txt"));

    let store = project.store();
    assert!(store.get("quick").is_some());
    assert!(store.get("next").is_none());

    // A follow-up run only does what was left undone
    let resumed = project.run(tasks).await;
    assert_eq!(resumed.state_of("quick"), Some(&TaskState::UpToDate));
    assert_eq!(resumed.state_of("next"), Some(&TaskState::Succeeded));
}

/// Test: Store stays readable
/// Given several tasks, some already committed when cancellation hits
/// When the run is cancelled mid-flight
/// Then the store file on disk loads cleanly and only names finished tasks
#[tokio::test]
async fn test_store_is_consistent_after_cancel() {
    let project = TestProject::new();
    let tasks = vec![
        Task::shell("fast", "echo fast > fast.txt").with_outputs(&["fast.txt"]),
        Task::shell("slow", "sleep 10").with_deps(&["fast"]),
    ];
    let cancel = CancellationToken::new();
    cancel_after(&cancel, Duration::from_millis(300));

    let (report, _) = project
        .run_with(tasks, project.options(1), cancel)
        .await;

    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.state_of("fast"), Some(&TaskState::Succeeded));
    assert_eq!(report.state_of("slow"), Some(&TaskState::Pending));

    let raw = std::fs::read_to_string(project.store_path()).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
    let names: Vec<&String> = doc["entries"].as_object().unwrap().keys().collect();
    assert_eq!(names, vec!["fast"]);
}
