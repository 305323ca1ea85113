#![cfg(unix)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reconcile_core::config::OrchestratorConfig;
use reconcile_core::execution::TokioProcessExecutor;
use reconcile_core::models::{
    OutcomeKind, RunExitStatus, SelectedOutcome, TaskCategory, TaskState,
};
use reconcile_core::orchestration::Scheduler;
use reconcile_core::persistence::{ExecutionStore, StatusStore};
use reconcile_core::sqlite::SqliteStore;

struct Fixture {
    config: OrchestratorConfig,
    store: Arc<SqliteStore>,
}

impl Fixture {
    fn new(test_name: &str, max_parallel: usize) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_nanos();
        let base = std::env::temp_dir().join(format!("reconcile-{test_name}-{nanos}"));
        let config = OrchestratorConfig {
            task_root: base.join("tasks"),
            interpreter: Some(PathBuf::from("/bin/sh")),
            database_path: base.join("status.sqlite3"),
            report_dir: base.join("reports"),
            max_parallel,
            timeout_seconds: 10,
            ..OrchestratorConfig::default()
        };
        fs::create_dir_all(&config.task_root).unwrap();

        let store = SqliteStore::new(&config.database_path);
        store.migrate_to_latest().expect("migration should succeed");
        Self {
            config,
            store: Arc::new(store),
        }
    }

    fn add_task(&self, name: &str, category: &str, script: &str) {
        write_task(&self.config.task_root, name, category, script);
    }

    fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            &self.config,
            Arc::new(TokioProcessExecutor),
            self.store.clone(),
        )
    }
}

fn write_task(root: &Path, name: &str, category: &str, script: &str) {
    let dir = root.join(name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("run"), format!("#!/bin/sh\n{script}\n")).unwrap();
    fs::write(
        dir.join("task.json"),
        format!(r#"{{"task": {{"category": "{category}"}}}}"#),
    )
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn admission_gate_bounds_concurrently_running_tasks() {
    let fixture = Fixture::new("gate", 2);
    for index in 0..5 {
        fixture.add_task(&format!("task_{index}"), "revenue", "sleep 0.5");
    }
    let scheduler = Arc::new(fixture.scheduler());

    let handle = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.run_all(None).await }
    });

    let mut peak = 0;
    while !handle.is_finished() {
        let running = fixture
            .store
            .list_statuses()
            .unwrap()
            .into_iter()
            .filter(|status| status.state == TaskState::Running)
            .count();
        peak = peak.max(running);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let run = handle.await.unwrap().unwrap();
    assert!(peak <= 2, "observed {peak} running tasks with a gate of 2");
    assert!(peak >= 1, "polling never observed a running task");
    assert_eq!(run.total, 5);
    assert_eq!(run.succeeded, 5);
    // Five half-second tasks two at a time need at least three rounds.
    assert!(run.elapsed_seconds >= 1.4, "elapsed {}", run.elapsed_seconds);
}

#[tokio::test]
async fn mixed_outcomes_are_consolidated() {
    let fixture = Fixture::new("mixed", 2);
    fixture.add_task("bank_fees", "revenue", "exit 0");
    fixture.add_task("ledger", "revenue", "echo 'ledger mismatch' >&2; exit 1");
    fixture.add_task("sales", "revenue", "exit 0");
    fixture.add_task("vat", "tax", "exit 4");
    fixture.add_task("withholding", "tax", "exit 0");

    let run = fixture.scheduler().run_all(None).await.unwrap();
    assert_eq!(run.total, 5);
    assert_eq!(run.succeeded, 3);
    assert_eq!(run.failed, 2);
    assert_eq!(run.timed_out, 0);
    assert_eq!(run.skipped, 0);
    assert_eq!(run.success_rate, 60.0);
    assert_eq!(run.exit_status(), RunExitStatus::TaskFailures);

    let ledger = run
        .outcomes
        .iter()
        .find(|outcome| outcome.task == "ledger")
        .unwrap();
    assert_eq!(ledger.error.as_deref(), Some("ledger mismatch"));

    let statuses = fixture.store.list_statuses().unwrap();
    assert_eq!(statuses.len(), 5);
    assert!(statuses.iter().all(|status| status.state.is_terminal()));
    assert_eq!(fixture.store.list_executions(None, 100).unwrap().len(), 5);
}

#[tokio::test]
async fn per_task_timeout_override_is_applied() {
    let fixture = Fixture::new("override", 2);
    fixture.add_task("slow", "tax", "sleep 30");
    fs::write(
        fixture.config.task_root.join("slow").join("task.json"),
        r#"{"task": {"category": "tax", "timeout_seconds": 1}}"#,
    )
    .unwrap();
    fixture.add_task("quick", "tax", "exit 0");

    let run = fixture.scheduler().run_all(None).await.unwrap();
    assert_eq!(run.total, 2);
    assert_eq!(run.succeeded, 1);
    assert_eq!(run.timed_out, 1);
    assert_eq!(run.failed, 0);
    assert!(run.elapsed_seconds < 10.0);
}

#[tokio::test]
async fn empty_task_root_is_nothing_to_do() {
    let fixture = Fixture::new("empty", 3);

    let run = fixture.scheduler().run_all(None).await.unwrap();
    assert_eq!(run.total, 0);
    assert_eq!(run.success_rate, 0.0);
    assert!(run.note.is_some());
    assert_eq!(run.exit_status(), RunExitStatus::NothingToDo);
}

#[tokio::test]
async fn category_filter_runs_only_matching_tasks() {
    let fixture = Fixture::new("category", 3);
    fixture.add_task("ledger", "revenue", "exit 0");
    fixture.add_task("vat", "tax", "exit 0");

    let scheduler = fixture.scheduler();
    let run = scheduler.run_category(TaskCategory::Tax, None).await.unwrap();
    assert_eq!(run.category, Some(TaskCategory::Tax));
    assert_eq!(run.total, 1);
    assert_eq!(run.outcomes[0].task, "vat");
    assert_eq!(run.exit_status(), RunExitStatus::Success);

    // Discovery registers every task, including the ones not run.
    let ledger = fixture.store.status("ledger").unwrap().unwrap();
    assert_eq!(ledger.state, TaskState::Idle);

    let empty = scheduler
        .run_category(TaskCategory::Other, None)
        .await
        .unwrap();
    assert_eq!(empty.total, 0);
    assert_eq!(
        empty.note.as_deref(),
        Some("no tasks found for category other")
    );
    assert_eq!(empty.exit_status(), RunExitStatus::NothingToDo);
}

#[tokio::test]
async fn selected_run_reports_unknown_names_and_keeps_order() {
    let fixture = Fixture::new("selected", 2);
    fixture.add_task("ledger", "revenue", "exit 0");
    fixture.add_task("vat", "tax", "exit 1");

    let names = vec![
        "vat".to_string(),
        "ghost".to_string(),
        "ledger".to_string(),
        "vat".to_string(),
    ];
    let results = fixture
        .scheduler()
        .run_selected(&names, Some("2024-03-01".parse().unwrap()))
        .await
        .unwrap();

    let tasks: Vec<&str> = results.iter().map(SelectedOutcome::task).collect();
    assert_eq!(tasks, vec!["vat", "ghost", "ledger"]);
    assert!(matches!(
        &results[0],
        SelectedOutcome::Executed(outcome) if outcome.kind == OutcomeKind::Error
    ));
    assert!(matches!(&results[1], SelectedOutcome::NotFound { task } if task == "ghost"));
    assert!(results[2].is_success());

    // The duplicate name ran once.
    assert_eq!(fixture.store.list_executions(Some("vat"), 10).unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_kills_running_task_and_skips_waiting_ones() {
    let fixture = Fixture::new("cancel", 1);
    for name in ["a_first", "b_second", "c_third"] {
        fixture.add_task(name, "revenue", "sleep 30");
    }
    let scheduler = Arc::new(fixture.scheduler());
    let cancellation = scheduler.cancellation();

    let handle = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.run_all(None).await }
    });

    let mut started = false;
    for _ in 0..250 {
        started = fixture
            .store
            .list_statuses()
            .unwrap()
            .iter()
            .any(|status| status.state == TaskState::Running);
        if started {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(started, "no task reached running");
    cancellation.cancel();

    let run = tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("cancelled run should finish promptly")
        .unwrap()
        .unwrap();
    assert_eq!(run.total, 1);
    assert_eq!(run.failed, 1);
    assert_eq!(run.skipped, 2);
    assert_eq!(
        run.outcomes[0].error.as_deref(),
        Some("cancelled before completion")
    );
    assert_eq!(run.exit_status(), RunExitStatus::TaskFailures);

    let running_left = fixture
        .store
        .list_statuses()
        .unwrap()
        .into_iter()
        .filter(|status| status.state == TaskState::Running)
        .count();
    assert_eq!(running_left, 0);
}
