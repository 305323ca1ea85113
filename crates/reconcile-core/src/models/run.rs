use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::models::{ExecutionOutcome, OutcomeKind, ReferenceDate, TaskCategory};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunExitStatus {
    Success,
    TaskFailures,
    NothingToDo,
}

impl RunExitStatus {
    pub fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::TaskFailures => 1,
            Self::NothingToDo => 2,
        }
    }
}

/// Aggregate of one orchestration invocation. Built by the scheduler and only
/// written to disk when exported as a run report.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedRun {
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub reference_date: ReferenceDate,
    pub category: Option<TaskCategory>,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub skipped: usize,
    pub elapsed_seconds: f64,
    pub success_rate: f64,
    pub note: Option<String>,
    pub outcomes: Vec<ExecutionOutcome>,
}

impl ConsolidatedRun {
    pub fn empty(
        started_at: OffsetDateTime,
        reference_date: ReferenceDate,
        category: Option<TaskCategory>,
        note: impl Into<String>,
    ) -> Self {
        Self {
            started_at,
            reference_date,
            category,
            total: 0,
            succeeded: 0,
            failed: 0,
            timed_out: 0,
            skipped: 0,
            elapsed_seconds: 0.0,
            success_rate: 0.0,
            note: Some(note.into()),
            outcomes: Vec::new(),
        }
    }

    pub fn from_outcomes(
        started_at: OffsetDateTime,
        reference_date: ReferenceDate,
        category: Option<TaskCategory>,
        outcomes: Vec<ExecutionOutcome>,
        skipped: usize,
        elapsed_seconds: f64,
    ) -> Self {
        let count = |kind: OutcomeKind| outcomes.iter().filter(|o| o.kind == kind).count();
        let total = outcomes.len();
        let succeeded = count(OutcomeKind::Success);

        Self {
            started_at,
            reference_date,
            category,
            total,
            succeeded,
            failed: count(OutcomeKind::Error),
            timed_out: count(OutcomeKind::Timeout),
            skipped,
            elapsed_seconds,
            success_rate: success_rate(succeeded, total),
            note: None,
            outcomes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0 && self.skipped == 0
    }

    pub fn exit_status(&self) -> RunExitStatus {
        if self.is_empty() {
            RunExitStatus::NothingToDo
        } else if self.failed > 0 || self.timed_out > 0 || self.skipped > 0 {
            RunExitStatus::TaskFailures
        } else {
            RunExitStatus::Success
        }
    }
}

/// Percentage of successes; zero when nothing was attempted.
pub fn success_rate(succeeded: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        succeeded as f64 / total as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use time::OffsetDateTime;

    use super::{ConsolidatedRun, RunExitStatus, success_rate};
    use crate::models::ReferenceDate;

    #[test]
    fn success_rate_of_empty_run_is_zero() {
        assert_eq!(success_rate(0, 0), 0.0);
        assert_eq!(success_rate(3, 5), 60.0);
    }

    #[test]
    fn empty_run_reports_nothing_to_do() {
        let run = ConsolidatedRun::empty(
            OffsetDateTime::now_utc(),
            ReferenceDate::today(),
            None,
            "no tasks found",
        );

        assert_eq!(run.total, 0);
        assert_eq!(run.success_rate, 0.0);
        assert_eq!(run.exit_status(), RunExitStatus::NothingToDo);
        assert_eq!(run.exit_status().code(), 2);
    }
}
