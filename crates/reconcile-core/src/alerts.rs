use std::time::Duration;

use time::OffsetDateTime;

use crate::config::DEFAULT_STALENESS_SECONDS;
use crate::models::{Alert, AlertKind, Criticality, TaskState, TaskStatusRecord};

/// Alerts for a status snapshot taken now, with the default staleness window.
pub fn alerts_from(statuses: &[TaskStatusRecord]) -> Vec<Alert> {
    alerts_at(
        statuses,
        OffsetDateTime::now_utc(),
        Duration::from_secs(DEFAULT_STALENESS_SECONDS),
    )
}

/// Derives alerts from current statuses. Pure: nothing is stored.
///
/// Every task in `error` yields an error alert. A critical task that is not
/// running and whose row is older than `staleness` yields an attention alert.
/// A critical task in `error` and stale gets both.
pub fn alerts_at(
    statuses: &[TaskStatusRecord],
    now: OffsetDateTime,
    staleness: Duration,
) -> Vec<Alert> {
    let staleness = time::Duration::try_from(staleness).unwrap_or(time::Duration::MAX);
    let mut alerts = Vec::new();

    for status in statuses {
        if status.state == TaskState::Error {
            alerts.push(Alert {
                kind: AlertKind::Error,
                criticality: status.criticality,
                task: status.task.clone(),
                message: format!(
                    "task {} failed: {}",
                    status.task,
                    status.error.as_deref().unwrap_or("unknown error")
                ),
                timestamp: status.updated_at,
            });
        }

        let idle_for = now - status.updated_at;
        if status.criticality == Criticality::Critical
            && status.state != TaskState::Running
            && idle_for > staleness
        {
            alerts.push(Alert {
                kind: AlertKind::Attention,
                criticality: status.criticality,
                task: status.task.clone(),
                message: format!(
                    "critical task {} has not run for {} minutes",
                    status.task,
                    idle_for.whole_minutes()
                ),
                timestamp: now,
            });
        }
    }

    alerts
}
