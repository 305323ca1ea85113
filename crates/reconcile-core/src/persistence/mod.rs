use time::OffsetDateTime;

use crate::models::{
    CoreError, DateRange, ExecutionMetrics, ExecutionRecord, NewExecutionRecord,
    TaskDescriptor, TaskStatusRecord,
};

pub type PersistenceResult<T> = Result<T, CoreError>;

pub trait MigrationStore: Send + Sync {
    fn current_version(&self) -> PersistenceResult<i64>;

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()>;
}

/// Current-status table. One row per task name, overwritten on every write.
pub trait StatusStore: Send + Sync {
    /// Inserts an `idle` row for a task that has never been seen, or refreshes
    /// the category and criticality tags of an existing row without touching
    /// its lifecycle state.
    fn register_task(&self, task: &TaskDescriptor) -> PersistenceResult<()>;

    fn upsert_status(&self, status: &TaskStatusRecord) -> PersistenceResult<()>;

    fn status(&self, task: &str) -> PersistenceResult<Option<TaskStatusRecord>>;

    /// All rows ordered by category, then task name.
    fn list_statuses(&self) -> PersistenceResult<Vec<TaskStatusRecord>>;
}

/// Append-only execution history.
pub trait ExecutionStore: Send + Sync {
    fn insert_execution(&self, record: &NewExecutionRecord) -> PersistenceResult<u64>;

    fn list_executions(
        &self,
        task: Option<&str>,
        limit: usize,
    ) -> PersistenceResult<Vec<ExecutionRecord>>;

    fn execution_metrics(&self, range: DateRange) -> PersistenceResult<ExecutionMetrics>;

    /// Deletes history rows executed before `cutoff` and returns how many were removed.
    fn purge_executions_before(&self, cutoff: OffsetDateTime) -> PersistenceResult<usize>;
}

pub trait ReconcileStore: StatusStore + ExecutionStore {}

impl<T: StatusStore + ExecutionStore> ReconcileStore for T {}
