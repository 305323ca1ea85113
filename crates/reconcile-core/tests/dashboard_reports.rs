use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reconcile_core::dashboard::{Dashboard, write_run_report};
use reconcile_core::models::{
    AlertKind, ConsolidatedRun, Criticality, DateRange, NewExecutionRecord, OutcomeKind,
    ReferenceDate, TaskCategory, TaskState, TaskStatusRecord,
};
use reconcile_core::persistence::{ExecutionStore, StatusStore};
use reconcile_core::sqlite::SqliteStore;
use time::OffsetDateTime;

fn temp_dir(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("reconcile-{test_name}-{nanos}"))
}

fn status(
    task: &str,
    category: TaskCategory,
    criticality: Criticality,
    state: TaskState,
    updated_at: OffsetDateTime,
) -> TaskStatusRecord {
    TaskStatusRecord {
        task: task.to_string(),
        category,
        criticality,
        state,
        progress: if state == TaskState::Success { 100 } else { 0 },
        message: None,
        started_at: None,
        finished_at: None,
        updated_at,
        result: None,
        error: (state == TaskState::Error).then(|| "file missing".to_string()),
    }
}

fn seeded_dashboard(test_name: &str) -> (Dashboard, PathBuf) {
    let dir = temp_dir(test_name);
    let store = SqliteStore::new(dir.join("status.sqlite3"));
    store.migrate_to_latest().unwrap();

    let now = OffsetDateTime::now_utc();
    for record in [
        status("ledger", TaskCategory::Revenue, Criticality::Medium, TaskState::Success, now),
        status("sales", TaskCategory::Revenue, Criticality::High, TaskState::Error, now),
        status(
            "vat",
            TaskCategory::Tax,
            Criticality::Critical,
            TaskState::Success,
            now - time::Duration::hours(2),
        ),
        status("payroll", TaskCategory::Other, Criticality::Medium, TaskState::Running, now),
    ] {
        store.upsert_status(&record).unwrap();
    }
    store
        .insert_execution(&NewExecutionRecord {
            task: "ledger".to_string(),
            category: TaskCategory::Revenue,
            criticality: Criticality::Medium,
            reference_date: ReferenceDate::today(),
            outcome: OutcomeKind::Success,
            elapsed_seconds: 2.5,
            records_processed: 40,
            records_valid: 40,
            records_invalid: 0,
            success_rate: Some(100.0),
            result: serde_json::json!({ "status": "success" }),
            executed_at: now,
        })
        .unwrap();

    (
        Dashboard::new(Arc::new(store), Duration::from_secs(3600)),
        dir,
    )
}

#[test]
fn snapshot_groups_statuses_and_derives_alerts() {
    let (dashboard, _) = seeded_dashboard("snapshot");
    let snapshot = dashboard.snapshot(DateRange::all()).unwrap();

    assert_eq!(snapshot.statistics.total, 4);
    assert_eq!(snapshot.statistics.success, 2);
    assert_eq!(snapshot.statistics.error, 1);
    assert_eq!(snapshot.statistics.running, 1);
    assert_eq!(snapshot.statistics.success_rate, 50.0);

    assert_eq!(snapshot.by_category[&TaskCategory::Revenue].len(), 2);
    assert_eq!(snapshot.by_category[&TaskCategory::Tax][0].task, "vat");

    assert_eq!(snapshot.metrics.total_runs, 1);
    assert_eq!(snapshot.metrics.total_records_processed, 40);

    let mut alerts: Vec<(AlertKind, String)> = snapshot
        .alerts
        .iter()
        .map(|alert| (alert.kind, alert.task.clone()))
        .collect();
    alerts.sort_by(|left, right| left.1.cmp(&right.1));
    assert_eq!(
        alerts,
        vec![
            (AlertKind::Error, "sales".to_string()),
            (AlertKind::Attention, "vat".to_string()),
        ]
    );
    assert_eq!(dashboard.alerts().unwrap().len(), 2);
}

#[test]
fn consolidated_report_is_written_as_timestamped_json() {
    let (dashboard, dir) = seeded_dashboard("report");
    let report_dir = dir.join("reports");

    let path = dashboard.write_report(&report_dir).unwrap();
    let file_name = path.file_name().unwrap().to_str().unwrap().to_string();
    assert!(file_name.starts_with("consolidated_report_"), "{file_name}");
    assert!(file_name.ends_with(".json"), "{file_name}");
    // consolidated_report_YYYYMMDD_HHMMSS.json
    assert_eq!(file_name.len(), "consolidated_report_".len() + 15 + ".json".len());

    let body: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(body["statistics"]["total"], 4);
    assert_eq!(body["by_category"]["revenue"].as_array().unwrap().len(), 2);
    assert_eq!(body["alerts"].as_array().unwrap().len(), 2);
}

#[test]
fn run_report_exports_consolidated_run() {
    let dir = temp_dir("run-report");
    let run = ConsolidatedRun::from_outcomes(
        OffsetDateTime::now_utc(),
        "2024-03-01".parse().unwrap(),
        Some(TaskCategory::Tax),
        Vec::new(),
        0,
        0.0,
    );

    let path = write_run_report(&dir, &run).unwrap();
    assert!(
        path.file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("run_report_")
    );

    let parsed: ConsolidatedRun =
        serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(parsed.reference_date.to_string(), "2024-03-01");
    assert_eq!(parsed.category, Some(TaskCategory::Tax));
}
