pub mod scheduler;
pub mod task_runner;

pub use scheduler::Scheduler;
pub use task_runner::{TaskRunner, parse_task_report};

use crate::models::CoreError;

pub type OrchestrationResult<T> = Result<T, CoreError>;
