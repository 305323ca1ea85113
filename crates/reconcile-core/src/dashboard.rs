use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::macros::format_description;

use crate::alerts::alerts_at;
use crate::models::{
    Alert, ConsolidatedRun, CoreError, CoreErrorKind, DateRange, ExecutionMetrics, TaskCategory,
    TaskState, TaskStatusRecord, success_rate,
};
use crate::persistence::{PersistenceResult, ReconcileStore};

/// Counts over the current status table.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusStatistics {
    pub total: usize,
    pub idle: usize,
    pub running: usize,
    pub success: usize,
    pub error: usize,
    pub timeout: usize,
    pub success_rate: f64,
}

impl StatusStatistics {
    pub fn from_statuses(statuses: &[TaskStatusRecord]) -> Self {
        let count = |state: TaskState| statuses.iter().filter(|s| s.state == state).count();
        let success = count(TaskState::Success);

        Self {
            total: statuses.len(),
            idle: count(TaskState::Idle),
            running: count(TaskState::Running),
            success,
            error: count(TaskState::Error),
            timeout: count(TaskState::Timeout),
            success_rate: success_rate(success, statuses.len()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DashboardSnapshot {
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub statistics: StatusStatistics,
    pub by_category: BTreeMap<TaskCategory, Vec<TaskStatusRecord>>,
    pub metrics: ExecutionMetrics,
    pub alerts: Vec<Alert>,
}

/// Read side of the status store: current statuses, history metrics and
/// alerts, plus the consolidated report export.
#[derive(Clone)]
pub struct Dashboard {
    store: Arc<dyn ReconcileStore>,
    staleness: Duration,
}

impl Dashboard {
    pub fn new(store: Arc<dyn ReconcileStore>, staleness: Duration) -> Self {
        Self { store, staleness }
    }

    pub fn statuses(&self) -> PersistenceResult<Vec<TaskStatusRecord>> {
        self.store.list_statuses()
    }

    pub fn metrics(&self, range: DateRange) -> PersistenceResult<ExecutionMetrics> {
        self.store.execution_metrics(range)
    }

    pub fn alerts(&self) -> PersistenceResult<Vec<Alert>> {
        let statuses = self.store.list_statuses()?;
        Ok(alerts_at(&statuses, OffsetDateTime::now_utc(), self.staleness))
    }

    pub fn snapshot(&self, range: DateRange) -> PersistenceResult<DashboardSnapshot> {
        let generated_at = OffsetDateTime::now_utc();
        let statuses = self.store.list_statuses()?;
        let metrics = self.store.execution_metrics(range)?;
        let alerts = alerts_at(&statuses, generated_at, self.staleness);
        let statistics = StatusStatistics::from_statuses(&statuses);

        let mut by_category: BTreeMap<TaskCategory, Vec<TaskStatusRecord>> = BTreeMap::new();
        for status in statuses {
            by_category.entry(status.category).or_default().push(status);
        }

        Ok(DashboardSnapshot {
            generated_at,
            statistics,
            by_category,
            metrics,
            alerts,
        })
    }

    /// Writes the full snapshot to `consolidated_report_<timestamp>.json`
    /// under `dir` and returns the file path.
    pub fn write_report(&self, dir: &Path) -> PersistenceResult<PathBuf> {
        let snapshot = self.snapshot(DateRange::all())?;
        let path = write_json(dir, "consolidated_report", snapshot.generated_at, &snapshot)?;
        tracing::info!(path = %path.display(), "consolidated report written");
        Ok(path)
    }
}

/// Writes one run's aggregate to `run_report_<timestamp>.json` under `dir`.
pub fn write_run_report(dir: &Path, run: &ConsolidatedRun) -> PersistenceResult<PathBuf> {
    let path = write_json(dir, "run_report", run.started_at, run)?;
    tracing::info!(path = %path.display(), total = run.total, "run report written");
    Ok(path)
}

fn write_json<T: Serialize>(
    dir: &Path,
    prefix: &str,
    at: OffsetDateTime,
    value: &T,
) -> PersistenceResult<PathBuf> {
    let stamp = at
        .format(format_description!(
            "[year][month][day]_[hour][minute][second]"
        ))
        .map_err(|error| report_error(format!("failed to format report timestamp: {error}")))?;
    let path = dir.join(format!("{prefix}_{stamp}.json"));

    fs::create_dir_all(dir).map_err(|error| {
        report_error(format!(
            "failed to create report directory '{}': {error}",
            dir.display()
        ))
    })?;
    let body = serde_json::to_string_pretty(value)
        .map_err(|error| report_error(format!("failed to encode report: {error}")))?;
    fs::write(&path, body).map_err(|error| {
        report_error(format!(
            "failed to write report '{}': {error}",
            path.display()
        ))
    })?;

    Ok(path)
}

fn report_error(message: String) -> CoreError {
    CoreError::new(CoreErrorKind::StorageFailure, message)
}
