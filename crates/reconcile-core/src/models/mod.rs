pub mod alert;
pub mod error;
pub mod execution;
pub mod metrics;
pub mod run;
pub mod status;
pub mod task;

pub use alert::{Alert, AlertKind};
pub use error::{CoreError, CoreErrorKind};
pub use execution::{
    ExecutionOutcome, ExecutionRecord, NewExecutionRecord, OutcomeKind, SelectedOutcome,
    TaskReport,
};
pub use metrics::{CategoryMetrics, DateRange, ExecutionMetrics};
pub use run::{ConsolidatedRun, RunExitStatus, success_rate};
pub use status::{TaskState, TaskStatusRecord};
pub use task::{Criticality, ReferenceDate, TaskCategory, TaskDescriptor};
