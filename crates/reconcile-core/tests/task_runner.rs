#![cfg(unix)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use reconcile_core::execution::TokioProcessExecutor;
use reconcile_core::models::{OutcomeKind, ReferenceDate, TaskDescriptor, TaskState};
use reconcile_core::orchestration::TaskRunner;
use reconcile_core::persistence::{ExecutionStore, StatusStore};
use reconcile_core::registry::TaskRegistry;
use reconcile_core::sqlite::SqliteStore;

const TIMEOUT: Duration = Duration::from_secs(10);

fn unique(test_name: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    format!("reconcile-{test_name}-{nanos}")
}

struct Fixture {
    root: PathBuf,
    store: Arc<SqliteStore>,
}

impl Fixture {
    fn new(test_name: &str) -> Self {
        let root = std::env::temp_dir().join(unique(test_name));
        fs::create_dir_all(&root).unwrap();
        let store = SqliteStore::new(root.join("status.sqlite3"));
        store.migrate_to_latest().expect("migration should succeed");
        Self {
            root: root.join("tasks"),
            store: Arc::new(store),
        }
    }

    fn task(&self, name: &str, script: &str) -> TaskDescriptor {
        write_script(&self.root, name, script);
        TaskRegistry::new(&self.root, "run", "task.json")
            .find(name)
            .expect("task should be discovered")
    }

    fn runner(&self) -> TaskRunner {
        TaskRunner::new(Arc::new(TokioProcessExecutor), self.store.clone())
            .with_interpreter(Some(PathBuf::from("/bin/sh")))
    }
}

fn write_script(root: &Path, name: &str, script: &str) {
    let dir = root.join(name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("run"), format!("#!/bin/sh\n{script}\n")).unwrap();
}

#[tokio::test]
async fn success_records_status_history_and_task_report() {
    let fixture = Fixture::new("runner-success");
    let task = fixture.task(
        "ledger",
        r#"echo "loading ledger"
echo '{"total_records": 20, "valid_records": 18, "invalid_records": 2, "success_rate": 90.0}'"#,
    );

    let outcome = fixture.runner().run(&task, None, TIMEOUT, None).await.unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Success);
    assert_eq!(outcome.exit_code, Some(0));
    assert!(outcome.stdout.contains("loading ledger"));
    let report = outcome.report.as_ref().expect("task report should parse");
    assert_eq!(report.total_records, Some(20));
    assert_eq!(outcome.reference_date, ReferenceDate::today());

    let status = fixture.store.status("ledger").unwrap().unwrap();
    assert_eq!(status.state, TaskState::Success);
    assert_eq!(status.progress, 100);
    assert!(status.error.is_none());
    let result = status.result.expect("success keeps a result payload");
    assert_eq!(result["status"], "success");
    assert_eq!(result["report"]["valid_records"], 18);

    let history = fixture.store.list_executions(Some("ledger"), 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].outcome, OutcomeKind::Success);
    assert_eq!(history[0].records_processed, 20);
    assert_eq!(history[0].records_invalid, 2);
    assert_eq!(history[0].success_rate, Some(90.0));
}

#[tokio::test]
async fn reference_date_is_passed_as_argument_and_recorded() {
    let fixture = Fixture::new("runner-date");
    let task = fixture.task("vat", r#"echo "args: $*""#);
    let date: ReferenceDate = "2024-03-01".parse().unwrap();

    let outcome = fixture
        .runner()
        .run(&task, Some(date), TIMEOUT, None)
        .await
        .unwrap();
    assert_eq!(outcome.stdout.trim(), "args: --date 2024-03-01");
    assert_eq!(outcome.reference_date, date);

    let history = fixture.store.list_executions(Some("vat"), 10).unwrap();
    assert_eq!(history[0].reference_date, date);

    let undated = fixture.runner().run(&task, None, TIMEOUT, None).await.unwrap();
    assert_eq!(undated.stdout.trim(), "args:");
}

#[tokio::test]
async fn task_runs_inside_its_own_directory() {
    let fixture = Fixture::new("runner-cwd");
    let task = fixture.task("ledger", "pwd");

    let outcome = fixture.runner().run(&task, None, TIMEOUT, None).await.unwrap();
    assert_eq!(
        fs::canonicalize(outcome.stdout.trim()).unwrap(),
        task.working_dir
    );
}

#[tokio::test]
async fn nonzero_exit_is_error_with_stderr_detail() {
    let fixture = Fixture::new("runner-error");
    let task = fixture.task("ledger", "echo 'missing ledger file' >&2\nexit 2");

    let outcome = fixture.runner().run(&task, None, TIMEOUT, None).await.unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Error);
    assert_eq!(outcome.exit_code, Some(2));
    assert_eq!(outcome.error.as_deref(), Some("missing ledger file"));

    let status = fixture.store.status("ledger").unwrap().unwrap();
    assert_eq!(status.state, TaskState::Error);
    assert_eq!(status.progress, 0);
    assert_eq!(status.error.as_deref(), Some("missing ledger file"));
    assert_eq!(status.message.as_deref(), Some("error: missing ledger file"));
    assert!(status.result.is_none());
}

#[tokio::test]
async fn nonzero_exit_with_empty_stderr_uses_placeholder() {
    let fixture = Fixture::new("runner-placeholder");
    let task = fixture.task("ledger", "exit 1");

    let outcome = fixture.runner().run(&task, None, TIMEOUT, None).await.unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Error);
    assert_eq!(outcome.error.as_deref(), Some("unknown error"));
}

#[tokio::test]
async fn stderr_detail_survives_a_background_child() {
    let fixture = Fixture::new("runner-lingering-error");
    let task = fixture.task("ledger", "echo 'ledger mismatch' >&2; sleep 3 & exit 1");

    let started = Instant::now();
    let outcome = fixture.runner().run(&task, None, TIMEOUT, None).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(3), "run took {:?}", started.elapsed());
    assert_eq!(outcome.kind, OutcomeKind::Error);
    assert_eq!(outcome.exit_code, Some(1));
    assert_eq!(outcome.error.as_deref(), Some("ledger mismatch"));

    let status = fixture.store.status("ledger").unwrap().unwrap();
    assert_eq!(status.error.as_deref(), Some("ledger mismatch"));
}

#[tokio::test]
async fn task_report_survives_a_background_child() {
    let fixture = Fixture::new("runner-lingering-report");
    let task = fixture.task(
        "ledger",
        r#"echo '{"total_records": 7}'
sleep 3 &"#,
    );

    let outcome = fixture.runner().run(&task, None, TIMEOUT, None).await.unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Success);
    let report = outcome.report.as_ref().expect("task report should parse");
    assert_eq!(report.total_records, Some(7));

    let history = fixture.store.list_executions(Some("ledger"), 10).unwrap();
    assert_eq!(history[0].records_processed, 7);
}

#[tokio::test]
async fn timeout_is_recorded_and_process_is_gone() {
    let fixture = Fixture::new("runner-timeout");
    let task = fixture.task("slow", "echo $$ > pid\nsleep 30");

    let outcome = fixture
        .runner()
        .run(&task, None, Duration::from_secs(1), None)
        .await
        .unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Timeout);
    assert_eq!(outcome.error.as_deref(), Some("timed out after 1 seconds"));
    assert!(outcome.elapsed_seconds < 10.0);

    let pid: i32 = fs::read_to_string(task.working_dir.join("pid"))
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    let alive = unsafe { libc::kill(pid, 0) } == 0;
    assert!(!alive, "timed out task process {pid} should be gone");

    let status = fixture.store.status("slow").unwrap().unwrap();
    assert_eq!(status.state, TaskState::Timeout);
    let history = fixture.store.list_executions(Some("slow"), 10).unwrap();
    assert_eq!(history[0].outcome, OutcomeKind::Timeout);
}

#[tokio::test]
async fn launch_failure_is_an_error_outcome() {
    let fixture = Fixture::new("runner-launch");
    // Not executable and no interpreter configured.
    let task = fixture.task("ledger", "exit 0");
    let runner = TaskRunner::new(Arc::new(TokioProcessExecutor), fixture.store.clone());

    let outcome = runner.run(&task, None, TIMEOUT, None).await.unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Error);
    assert_eq!(outcome.exit_code, None);
    assert!(
        outcome
            .error
            .as_deref()
            .unwrap_or_default()
            .starts_with("failed to launch task"),
        "unexpected error: {:?}",
        outcome.error
    );

    let status = fixture.store.status("ledger").unwrap().unwrap();
    assert_eq!(status.state, TaskState::Error);
    assert_eq!(fixture.store.list_executions(None, 10).unwrap().len(), 1);
}

#[tokio::test]
async fn repeated_runs_keep_one_status_and_grow_history() {
    let fixture = Fixture::new("runner-repeat");
    let task = fixture.task("ledger", "exit 0");
    let runner = fixture.runner();

    runner.run(&task, None, TIMEOUT, None).await.unwrap();
    runner.run(&task, None, TIMEOUT, None).await.unwrap();

    assert_eq!(fixture.store.list_statuses().unwrap().len(), 1);
    assert_eq!(fixture.store.list_executions(None, 10).unwrap().len(), 2);
}
