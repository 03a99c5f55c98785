//! Incremental rebuild tests.
//!
//! These tests verify that a second run does nothing when nothing changed
//! and that a change reruns exactly the tasks reachable from it.

use kiln::core::{Action, Task, TaskState};
use kiln::manifest::Manifest;
use kiln::orchestration::RunStatus;
use std::fs;
use tokio_util::sync::CancellationToken;

use crate::fixtures::{compile_link_project, started_order, TestProject};

/// Test: First run builds everything
/// Given a compile/link project with no store
/// When the scheduler runs
/// Then every task succeeds and the store records all three
#[tokio::test]
async fn test_first_run_builds_everything() {
    let (project, tasks) = compile_link_project();

    let report = project.run(tasks).await;

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.exit_code(), 0);
    for name in ["compile_a", "compile_b", "link"] {
        assert_eq!(report.state_of(name), Some(&TaskState::Succeeded), "{}", name);
    }
    assert_eq!(
        project.read("app"),
        "int a() { return 1; }\nint b() { return 2; }\n"
    );
    assert_eq!(project.store().len(), 3);
}

/// Test: Nothing changed
/// Given a project that was just built
/// When the scheduler runs again
/// Then every task is UpToDate and nothing is started
#[tokio::test]
async fn test_unchanged_project_is_up_to_date() {
    let (project, tasks) = compile_link_project();
    project.run(tasks.clone()).await;

    let (report, events) = project
        .run_with(tasks, project.options(4), CancellationToken::new())
        .await;

    assert_eq!(report.status, RunStatus::Succeeded);
    assert!(report.tasks.iter().all(|t| t.state == TaskState::UpToDate));
    assert!(started_order(&events).is_empty());
}

/// Test: One source changed
/// Given a built project
/// When b.c changes
/// Then compile_b and link rerun while compile_a stays UpToDate
#[tokio::test]
async fn test_changed_source_reruns_reachable_tasks() {
    let (project, tasks) = compile_link_project();
    project.run(tasks.clone()).await;

    project.write("b.c", "int b() { return 3; }\n");
    let report = project.run(tasks).await;

    assert_eq!(report.state_of("compile_a"), Some(&TaskState::UpToDate));
    assert_eq!(report.state_of("compile_b"), Some(&TaskState::Succeeded));
    assert_eq!(report.state_of("link"), Some(&TaskState::Succeeded));
    assert!(project.read("app").contains("return 3"));
}

/// Test: Output deleted
/// Given a built project
/// When the final artifact is removed
/// Then only link reruns and restores it
#[tokio::test]
async fn test_deleted_output_reruns_producer() {
    let (project, tasks) = compile_link_project();
    project.run(tasks.clone()).await;

    project.remove("app");
    let report = project.run(tasks).await;

    assert_eq!(report.state_of("compile_a"), Some(&TaskState::UpToDate));
    assert_eq!(report.state_of("compile_b"), Some(&TaskState::UpToDate));
    assert_eq!(report.state_of("link"), Some(&TaskState::Succeeded));
    assert!(project.exists("app"));
}

/// Test: Intermediate output tampered with
/// Given a built project
/// When a.o is edited by hand
/// Then compile_a reruns to restore it and link follows
#[tokio::test]
async fn test_tampered_output_reruns_producer() {
    let (project, tasks) = compile_link_project();
    project.run(tasks.clone()).await;

    project.write("a.o", "garbage");
    let report = project.run(tasks).await;

    assert_eq!(report.state_of("compile_a"), Some(&TaskState::Succeeded));
    assert_eq!(report.state_of("link"), Some(&TaskState::Succeeded));
    assert_eq!(report.state_of("compile_b"), Some(&TaskState::UpToDate));
    assert_eq!(project.read("a.o"), "int a() { return 1; }\n");
}

/// Test: Command edited
/// Given a built project
/// When the link command changes
/// Then link reruns with the reason recorded
#[tokio::test]
async fn test_changed_command_reruns_task() {
    let (project, mut tasks) = compile_link_project();
    project.run(tasks.clone()).await;

    tasks[2] = tasks[2].clone().with_action(Action::Shell {
        command: "cat b.o a.o > app".to_string(),
    });
    let report = project.run(tasks).await;

    let link = report.outcome("link").unwrap();
    assert_eq!(link.state, TaskState::Succeeded);
    assert_eq!(link.reason.as_deref(), Some("action changed"));
    assert!(project.read("app").starts_with("int b()"));
}

/// Test: Dry run
/// Given a built project with one changed source
/// When a dry run is requested
/// Then the stale tasks are reported and nothing runs or is committed
#[tokio::test]
async fn test_dry_run_reports_without_running() {
    let (project, tasks) = compile_link_project();
    project.run(tasks.clone()).await;
    let store_before = fs::read_to_string(project.store_path()).unwrap();

    project.write("a.c", "int a() { return 9; }\n");
    let mut options = project.options(4);
    options.dry_run = true;
    let (report, events) = project
        .run_with(tasks, options, CancellationToken::new())
        .await;

    assert_eq!(report.status, RunStatus::DryRun);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.state_of("compile_a"), Some(&TaskState::Stale));
    assert_eq!(report.state_of("link"), Some(&TaskState::Stale));
    assert_eq!(report.state_of("compile_b"), Some(&TaskState::UpToDate));
    assert!(started_order(&events).is_empty());
    assert!(project.read("a.o").contains("return 1"));
    assert_eq!(fs::read_to_string(project.store_path()).unwrap(), store_before);
}

/// Test: Corrupt store
/// Given a built project whose store file is garbage
/// When the scheduler runs
/// Then it rebuilds everything instead of failing
#[tokio::test]
async fn test_corrupt_store_rebuilds_everything() {
    let (project, tasks) = compile_link_project();
    project.run(tasks.clone()).await;

    fs::write(project.store_path(), "{ not json").unwrap();
    let report = project.run(tasks).await;

    assert_eq!(report.status, RunStatus::Succeeded);
    assert!(report.tasks.iter().all(|t| t.state == TaskState::Succeeded));
    assert_eq!(project.store().len(), 3);
}

/// Test: Directory inputs
/// Given a task reading a whole directory
/// When a file is added to that directory
/// Then the task reruns
#[tokio::test]
async fn test_new_file_in_input_directory_reruns() {
    let project = TestProject::new();
    project.write("src/one.txt", "1");
    let tasks = vec![Task::shell("bundle", "cat src/*.txt > bundle.txt")
        .with_inputs(&["src"])
        .with_outputs(&["bundle.txt"])];
    project.run(tasks.clone()).await;

    let again = project.run(tasks.clone()).await;
    assert_eq!(again.state_of("bundle"), Some(&TaskState::UpToDate));

    project.write("src/two.txt", "2");
    let report = project.run(tasks).await;
    assert_eq!(report.state_of("bundle"), Some(&TaskState::Succeeded));
    assert_eq!(project.read("bundle.txt"), "12");
}

/// Test: Self-referencing symlink in an input directory
/// Given an input directory containing a symlink back to itself
/// When the task runs twice
/// Then it succeeds once and is up to date the second time
#[tokio::test]
async fn test_symlink_loop_in_input_directory() {
    let project = TestProject::new();
    project.write("src/one.txt", "1");
    std::os::unix::fs::symlink(".", project.path.join("src/self")).unwrap();
    let tasks = vec![Task::shell("bundle", "cat src/one.txt > bundle.txt")
        .with_inputs(&["src"])
        .with_outputs(&["bundle.txt"])];

    let first = project.run(tasks.clone()).await;
    assert_eq!(first.state_of("bundle"), Some(&TaskState::Succeeded));

    let second = project.run(tasks).await;
    assert_eq!(second.state_of("bundle"), Some(&TaskState::UpToDate));
}

/// Test: Manifest-driven run
/// Given a kiln.toml describing a generate/consume pair
/// When it is loaded and run twice
/// Then the second run is a no-op
#[tokio::test]
async fn test_manifest_round_trip() {
    let project = TestProject::new();
    project.write(
        "kiln.toml",
        r#"
        [[task]]
        name = "generate"
        command = "echo generated > gen.txt"
        outputs = ["gen.txt"]

        [[task]]
        name = "consume"
        exec = ["sh", "-c", "cp gen.txt copy.txt"]
        inputs = ["gen.txt"]
        outputs = ["copy.txt"]
        "#,
    );

    let manifest = Manifest::load(&project.path.join("kiln.toml")).unwrap();
    let first = project.run(manifest.tasks.clone()).await;
    assert_eq!(first.status, RunStatus::Succeeded);
    assert_eq!(project.read("copy.txt"), "generated\n");

    let second = project.run(manifest.tasks).await;
    assert!(second.tasks.iter().all(|t| t.state == TaskState::UpToDate));
}
