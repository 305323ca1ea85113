use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::models::{Criticality, ReferenceDate, TaskCategory, TaskState};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    Error,
    Timeout,
}

impl OutcomeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }

    pub fn task_state(self) -> TaskState {
        match self {
            Self::Success => TaskState::Success,
            Self::Error => TaskState::Error,
            Self::Timeout => TaskState::Timeout,
        }
    }
}

impl std::str::FromStr for OutcomeKind {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            "timeout" => Ok(Self::Timeout),
            _ => Err(()),
        }
    }
}

/// Optional summary a task prints as the last line of its stdout.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskReport {
    pub total_records: Option<u64>,
    pub valid_records: Option<u64>,
    pub invalid_records: Option<u64>,
    pub success_rate: Option<f64>,
}

/// Terminal result of one task run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub task: String,
    pub category: TaskCategory,
    pub criticality: Criticality,
    pub kind: OutcomeKind,
    pub reference_date: ReferenceDate,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
    pub report: Option<TaskReport>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    pub elapsed_seconds: f64,
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        self.kind == OutcomeKind::Success
    }
}

/// Result entry of an explicit name-list run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SelectedOutcome {
    Executed(ExecutionOutcome),
    NotFound { task: String },
    /// Never started because the run was cancelled while it waited for a slot.
    Skipped { task: String },
}

impl SelectedOutcome {
    pub fn task(&self) -> &str {
        match self {
            Self::Executed(outcome) => &outcome.task,
            Self::NotFound { task } | Self::Skipped { task } => task,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Executed(outcome) if outcome.is_success())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewExecutionRecord {
    pub task: String,
    pub category: TaskCategory,
    pub criticality: Criticality,
    pub reference_date: ReferenceDate,
    pub outcome: OutcomeKind,
    pub elapsed_seconds: f64,
    pub records_processed: u64,
    pub records_valid: u64,
    pub records_invalid: u64,
    pub success_rate: Option<f64>,
    pub result: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub executed_at: OffsetDateTime,
}

/// Append-only history row; never updated after insert.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: u64,
    pub task: String,
    pub category: TaskCategory,
    pub criticality: Criticality,
    pub reference_date: ReferenceDate,
    pub outcome: OutcomeKind,
    pub elapsed_seconds: f64,
    pub records_processed: u64,
    pub records_valid: u64,
    pub records_invalid: u64,
    pub success_rate: Option<f64>,
    pub result: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub executed_at: OffsetDateTime,
}
