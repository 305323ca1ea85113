use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::models::{Criticality, TaskCategory};

/// Lifecycle of a task as seen by the status table.
///
/// `idle -> running -> {success | error | timeout}`; only a new orchestration
/// cycle moves a terminal task back to `running`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Idle,
    Running,
    Success,
    Error,
    Timeout,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Timeout)
    }
}

impl std::str::FromStr for TaskState {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            "timeout" => Ok(Self::Timeout),
            _ => Err(()),
        }
    }
}

/// Current status row for one task. There is exactly one per task name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusRecord {
    pub task: String,
    pub category: TaskCategory,
    pub criticality: Criticality,
    pub state: TaskState,
    pub progress: u8,
    pub message: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}
