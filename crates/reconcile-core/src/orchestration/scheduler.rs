use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::OrchestratorConfig;
use crate::execution::ProcessExecutor;
use crate::models::{
    ConsolidatedRun, CoreError, CoreErrorKind, ExecutionOutcome, ReferenceDate, SelectedOutcome,
    TaskCategory, TaskDescriptor,
};
use crate::orchestration::{OrchestrationResult, TaskRunner};
use crate::persistence::ReconcileStore;
use crate::registry::TaskRegistry;

/// Fans a batch of tasks out onto the tokio runtime behind a shared admission
/// gate and joins them back into one result.
///
/// The gate belongs to the scheduler, so concurrent calls on the same instance
/// share the `max_parallel` bound.
pub struct Scheduler {
    registry: TaskRegistry,
    runner: TaskRunner,
    store: Arc<dyn ReconcileStore>,
    gate: Arc<Semaphore>,
    default_timeout: Duration,
    cancellation: CancellationToken,
}

enum Dispatch {
    Completed(ExecutionOutcome),
    Skipped,
}

impl Scheduler {
    pub fn new(
        config: &OrchestratorConfig,
        executor: Arc<dyn ProcessExecutor>,
        store: Arc<dyn ReconcileStore>,
    ) -> Self {
        let runner = TaskRunner::new(executor, store.clone())
            .with_interpreter(config.interpreter.clone());
        Self::from_parts(
            TaskRegistry::from_config(config),
            runner,
            store,
            config.max_parallel(),
            config.timeout(),
        )
    }

    pub fn from_parts(
        registry: TaskRegistry,
        runner: TaskRunner,
        store: Arc<dyn ReconcileStore>,
        max_parallel: usize,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            runner,
            store,
            gate: Arc::new(Semaphore::new(max_parallel.max(1))),
            default_timeout,
            cancellation: CancellationToken::new(),
        }
    }

    /// Token that stops the scheduler: running tasks are killed and recorded
    /// as errors, tasks still waiting for a slot are skipped.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Discovers tasks and makes sure each one has a status row.
    pub async fn discover(&self) -> OrchestrationResult<Vec<TaskDescriptor>> {
        let registry = self.registry.clone();
        let store = self.store.clone();

        tokio::task::spawn_blocking(move || {
            let tasks = registry.discover();
            for task in &tasks {
                store.register_task(task)?;
            }
            Ok::<_, CoreError>(tasks)
        })
        .await
        .map_err(|join_error| {
            CoreError::new(
                CoreErrorKind::Internal,
                format!("task discovery join failure: {join_error}"),
            )
        })?
    }

    pub async fn run_all(
        &self,
        reference_date: Option<ReferenceDate>,
    ) -> OrchestrationResult<ConsolidatedRun> {
        let started_at = OffsetDateTime::now_utc();
        let clock = Instant::now();
        let tasks = self.discover().await?;

        if tasks.is_empty() {
            tracing::warn!(root = %self.registry.root().display(), "no tasks discovered");
            return Ok(ConsolidatedRun::empty(
                started_at,
                effective(reference_date),
                None,
                "no tasks discovered",
            ));
        }

        let dispatched = self.execute_batch(tasks, reference_date).await?;
        let run = consolidate(started_at, reference_date, None, dispatched, clock);
        log_summary(&run);
        Ok(run)
    }

    pub async fn run_category(
        &self,
        category: TaskCategory,
        reference_date: Option<ReferenceDate>,
    ) -> OrchestrationResult<ConsolidatedRun> {
        let started_at = OffsetDateTime::now_utc();
        let clock = Instant::now();
        let tasks: Vec<TaskDescriptor> = self
            .discover()
            .await?
            .into_iter()
            .filter(|task| task.category == category)
            .collect();

        if tasks.is_empty() {
            tracing::warn!(category = %category, "no tasks found for category");
            return Ok(ConsolidatedRun::empty(
                started_at,
                effective(reference_date),
                Some(category),
                format!("no tasks found for category {category}"),
            ));
        }

        let dispatched = self.execute_batch(tasks, reference_date).await?;
        let run = consolidate(started_at, reference_date, Some(category), dispatched, clock);
        log_summary(&run);
        Ok(run)
    }

    /// Runs the named tasks. Results follow the order of `names`, with repeated
    /// names collapsed to their first occurrence; unknown names are reported
    /// rather than failing the call.
    pub async fn run_selected(
        &self,
        names: &[String],
        reference_date: Option<ReferenceDate>,
    ) -> OrchestrationResult<Vec<SelectedOutcome>> {
        let mut seen = BTreeSet::new();
        let requested: Vec<&String> = names.iter().filter(|name| seen.insert(*name)).collect();

        let mut known: HashMap<String, TaskDescriptor> = self
            .discover()
            .await?
            .into_iter()
            .map(|task| (task.name.clone(), task))
            .collect();

        let tasks: Vec<TaskDescriptor> = requested
            .iter()
            .filter_map(|name| known.remove(name.as_str()))
            .collect();
        let mut dispatched: HashMap<String, Dispatch> = self
            .execute_batch(tasks, reference_date)
            .await?
            .into_iter()
            .collect();

        let results = requested
            .into_iter()
            .map(|name| match dispatched.remove(name.as_str()) {
                Some(Dispatch::Completed(outcome)) => SelectedOutcome::Executed(outcome),
                Some(Dispatch::Skipped) => SelectedOutcome::Skipped { task: name.clone() },
                None => {
                    tracing::warn!(task = %name, "requested task not found");
                    SelectedOutcome::NotFound { task: name.clone() }
                }
            })
            .collect();
        Ok(results)
    }

    async fn execute_batch(
        &self,
        tasks: Vec<TaskDescriptor>,
        reference_date: Option<ReferenceDate>,
    ) -> OrchestrationResult<Vec<(String, Dispatch)>> {
        tracing::info!(
            tasks = tasks.len(),
            available_slots = self.gate.available_permits(),
            "dispatching tasks"
        );

        let mut handles = Vec::with_capacity(tasks.len());
        for task in tasks {
            let gate = self.gate.clone();
            let runner = self.runner.clone();
            let cancellation = self.cancellation.clone();
            let timeout = task.timeout_override.unwrap_or(self.default_timeout);
            let dispatched = task.clone();

            let handle = tokio::spawn(dispatch_one(
                gate,
                runner,
                cancellation,
                task,
                reference_date,
                timeout,
            ));
            handles.push((dispatched, handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        let mut storage_failure: Option<CoreError> = None;

        for (task, handle) in handles {
            let failure_detail = match handle.await {
                Ok(Ok(Some(outcome))) => {
                    results.push((task.name, Dispatch::Completed(outcome)));
                    continue;
                }
                Ok(Ok(None)) => {
                    tracing::info!(task = %task.name, "task skipped after cancellation");
                    results.push((task.name, Dispatch::Skipped));
                    continue;
                }
                Ok(Err(error)) if error.is_storage_failure() => {
                    storage_failure.get_or_insert(error);
                    continue;
                }
                Ok(Err(error)) => error.message,
                Err(join_error) => format!("task execution panicked: {join_error}"),
            };

            match self
                .runner
                .record_failure(&task, reference_date, failure_detail)
                .await
            {
                Ok(outcome) => results.push((task.name, Dispatch::Completed(outcome))),
                Err(error) => {
                    storage_failure.get_or_insert(error);
                }
            }
        }

        if let Some(error) = storage_failure {
            tracing::error!(
                task = ?error.task,
                message = %error.message,
                "status store failed during run"
            );
            return Err(error);
        }

        Ok(results)
    }
}

/// Waits for a slot, then runs the task. `None` means the run was cancelled
/// before a slot opened up.
async fn dispatch_one(
    gate: Arc<Semaphore>,
    runner: TaskRunner,
    cancellation: CancellationToken,
    task: TaskDescriptor,
    reference_date: Option<ReferenceDate>,
    timeout: Duration,
) -> OrchestrationResult<Option<ExecutionOutcome>> {
    let permit = tokio::select! {
        permit = gate.acquire_owned() => permit.map_err(|error| {
            CoreError::for_task(
                &task.name,
                CoreErrorKind::Internal,
                format!("admission gate closed: {error}"),
            )
        })?,
        _ = cancellation.cancelled() => return Ok(None),
    };
    if cancellation.is_cancelled() {
        return Ok(None);
    }

    let outcome = runner
        .run(&task, reference_date, timeout, Some(&cancellation))
        .await;
    drop(permit);
    outcome.map(Some)
}

fn effective(reference_date: Option<ReferenceDate>) -> ReferenceDate {
    reference_date.unwrap_or_else(ReferenceDate::today)
}

fn consolidate(
    started_at: OffsetDateTime,
    reference_date: Option<ReferenceDate>,
    category: Option<TaskCategory>,
    dispatched: Vec<(String, Dispatch)>,
    clock: Instant,
) -> ConsolidatedRun {
    let mut outcomes = Vec::with_capacity(dispatched.len());
    let mut skipped = 0;
    for (_, dispatch) in dispatched {
        match dispatch {
            Dispatch::Completed(outcome) => outcomes.push(outcome),
            Dispatch::Skipped => skipped += 1,
        }
    }

    ConsolidatedRun::from_outcomes(
        started_at,
        effective(reference_date),
        category,
        outcomes,
        skipped,
        clock.elapsed().as_secs_f64(),
    )
}

fn log_summary(run: &ConsolidatedRun) {
    tracing::info!(
        category = ?run.category,
        total = run.total,
        succeeded = run.succeeded,
        failed = run.failed,
        timed_out = run.timed_out,
        skipped = run.skipped,
        success_rate = run.success_rate,
        elapsed_secs = run.elapsed_seconds,
        "run finished"
    );
}
