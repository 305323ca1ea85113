use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::execution::{
    CommandSpec, ProcessExecutor, ProcessExitStatus, ProcessOutput, ProcessSpawnRequest,
    spawn_validated,
};
use crate::models::{
    CoreError, CoreErrorKind, ExecutionOutcome, NewExecutionRecord, OutcomeKind, ReferenceDate,
    TaskDescriptor, TaskReport, TaskState, TaskStatusRecord,
};
use crate::orchestration::OrchestrationResult;
use crate::persistence::{PersistenceResult, ReconcileStore};

const EMPTY_STDERR_PLACEHOLDER: &str = "unknown error";
const CANCELLED_DETAIL: &str = "cancelled before completion";

/// Runs one task as a child process and records its lifecycle.
///
/// The `running` status is written before the process is spawned; the
/// terminal status and the history record are written after it exits, times
/// out or is cancelled. Only store failures surface as `Err`.
#[derive(Clone)]
pub struct TaskRunner {
    executor: Arc<dyn ProcessExecutor>,
    store: Arc<dyn ReconcileStore>,
    interpreter: Option<PathBuf>,
}

struct Classified {
    kind: OutcomeKind,
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
    error: Option<String>,
}

impl TaskRunner {
    pub fn new(executor: Arc<dyn ProcessExecutor>, store: Arc<dyn ReconcileStore>) -> Self {
        Self {
            executor,
            store,
            interpreter: None,
        }
    }

    /// Launches entry points through `interpreter` (e.g. `/bin/sh`) instead of
    /// executing them directly.
    pub fn with_interpreter(mut self, interpreter: Option<PathBuf>) -> Self {
        self.interpreter = interpreter;
        self
    }

    pub async fn run(
        &self,
        task: &TaskDescriptor,
        reference_date: Option<ReferenceDate>,
        timeout: Duration,
        cancellation: Option<&CancellationToken>,
    ) -> OrchestrationResult<ExecutionOutcome> {
        let effective_date = reference_date.unwrap_or_else(ReferenceDate::today);
        let started_at = OffsetDateTime::now_utc();

        let running = running_status(task, started_at);
        self.persist(&task.name, move |store| store.upsert_status(&running))
            .await?;

        tracing::info!(
            task = %task.name,
            category = %task.category,
            reference_date = %effective_date,
            timeout_secs = timeout.as_secs(),
            "starting task"
        );

        let clock = Instant::now();
        let mut request =
            ProcessSpawnRequest::new(task.name.clone(), self.command_for(task, reference_date))
                .timeout(timeout);
        if let Some(token) = cancellation {
            request = request.cancellation(token.clone());
        }

        let classified = match spawn_validated(self.executor.as_ref(), request) {
            Ok(process) => {
                tracing::debug!(task = %task.name, pid = ?process.pid(), "task process spawned");
                match process.wait().await {
                    Ok(output) => classify_output(output),
                    Err(error) => classify_interruption(error, timeout),
                }
            }
            Err(error) => failed(format!("failed to launch task: {}", error.message)),
        };

        let outcome = ExecutionOutcome {
            task: task.name.clone(),
            category: task.category,
            criticality: task.criticality,
            kind: classified.kind,
            reference_date: effective_date,
            exit_code: classified.exit_code,
            report: parse_task_report(&classified.stdout),
            stdout: classified.stdout,
            stderr: classified.stderr,
            error: classified.error,
            started_at,
            finished_at: OffsetDateTime::now_utc(),
            elapsed_seconds: clock.elapsed().as_secs_f64(),
        };

        self.record_terminal(&outcome).await?;
        log_outcome(&outcome);
        Ok(outcome)
    }

    /// Records an `error` outcome for a task whose run never produced one,
    /// for example because the runner itself panicked.
    pub async fn record_failure(
        &self,
        task: &TaskDescriptor,
        reference_date: Option<ReferenceDate>,
        detail: impl Into<String>,
    ) -> OrchestrationResult<ExecutionOutcome> {
        let now = OffsetDateTime::now_utc();
        let outcome = ExecutionOutcome {
            task: task.name.clone(),
            category: task.category,
            criticality: task.criticality,
            kind: OutcomeKind::Error,
            reference_date: reference_date.unwrap_or_else(ReferenceDate::today),
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(detail.into()),
            report: None,
            started_at: now,
            finished_at: now,
            elapsed_seconds: 0.0,
        };

        self.record_terminal(&outcome).await?;
        log_outcome(&outcome);
        Ok(outcome)
    }

    fn command_for(
        &self,
        task: &TaskDescriptor,
        reference_date: Option<ReferenceDate>,
    ) -> CommandSpec {
        let mut command =
            CommandSpec::for_entry_point(&task.entry_point, self.interpreter.as_deref());

        if let Some(date) = reference_date {
            command = command.args(["--date".to_string(), date.to_string()]);
        }

        command.working_dir(task.working_dir.clone())
    }

    async fn record_terminal(&self, outcome: &ExecutionOutcome) -> OrchestrationResult<()> {
        let status = terminal_status(outcome);
        let record = execution_record(outcome);

        self.persist(&outcome.task, move |store| store.upsert_status(&status))
            .await?;
        self.persist(&outcome.task, move |store| {
            store.insert_execution(&record).map(|_| ())
        })
        .await
    }

    async fn persist<F>(&self, task: &str, operation: F) -> OrchestrationResult<()>
    where
        F: FnOnce(&dyn ReconcileStore) -> PersistenceResult<()> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || operation(store.as_ref()))
            .await
            .map_err(|join_error| {
                CoreError::for_task(
                    task,
                    CoreErrorKind::StorageFailure,
                    format!("status persistence join failure: {join_error}"),
                )
            })?
            .map_err(|error| {
                tracing::error!(
                    task = %task,
                    kind = ?error.kind,
                    message = %error.message,
                    "failed to persist task status"
                );
                CoreError {
                    task: error.task.or_else(|| Some(task.to_string())),
                    ..error
                }
            })
    }
}

fn classify_output(output: ProcessOutput) -> Classified {
    let stdout = output.stdout_text();
    let stderr = output.stderr_text();

    match output.status {
        ProcessExitStatus::ExitCode(0) => Classified {
            kind: OutcomeKind::Success,
            exit_code: Some(0),
            stdout,
            stderr,
            error: None,
        },
        ProcessExitStatus::ExitCode(code) => {
            let detail = if stderr.trim().is_empty() {
                EMPTY_STDERR_PLACEHOLDER.to_string()
            } else {
                stderr.trim().to_string()
            };
            Classified {
                kind: OutcomeKind::Error,
                exit_code: Some(code),
                stdout,
                stderr,
                error: Some(detail),
            }
        }
        ProcessExitStatus::Terminated => Classified {
            kind: OutcomeKind::Error,
            exit_code: None,
            error: Some(if stderr.trim().is_empty() {
                "process terminated by signal".to_string()
            } else {
                stderr.trim().to_string()
            }),
            stdout,
            stderr,
        },
    }
}

fn classify_interruption(error: CoreError, timeout: Duration) -> Classified {
    match error.kind {
        CoreErrorKind::Timeout => Classified {
            kind: OutcomeKind::Timeout,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(timeout_message(timeout)),
        },
        CoreErrorKind::Cancelled => failed(CANCELLED_DETAIL.to_string()),
        _ => failed(error.message),
    }
}

fn failed(detail: String) -> Classified {
    Classified {
        kind: OutcomeKind::Error,
        exit_code: None,
        stdout: String::new(),
        stderr: String::new(),
        error: Some(detail),
    }
}

fn timeout_message(timeout: Duration) -> String {
    format!("timed out after {} seconds", timeout.as_secs_f64())
}

/// Reads the optional JSON summary a task prints as its last stdout line.
pub fn parse_task_report(stdout: &str) -> Option<TaskReport> {
    let last_line = stdout.lines().rev().find(|line| !line.trim().is_empty())?;
    let trimmed = last_line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

fn running_status(task: &TaskDescriptor, started_at: OffsetDateTime) -> TaskStatusRecord {
    TaskStatusRecord {
        task: task.name.clone(),
        category: task.category,
        criticality: task.criticality,
        state: TaskState::Running,
        progress: 0,
        message: Some("starting execution".to_string()),
        started_at: Some(started_at),
        finished_at: None,
        updated_at: started_at,
        result: None,
        error: None,
    }
}

fn terminal_status(outcome: &ExecutionOutcome) -> TaskStatusRecord {
    let message = match outcome.kind {
        OutcomeKind::Success => "execution completed successfully".to_string(),
        OutcomeKind::Error => format!(
            "error: {}",
            outcome.error.as_deref().unwrap_or(EMPTY_STDERR_PLACEHOLDER)
        ),
        OutcomeKind::Timeout => outcome
            .error
            .clone()
            .unwrap_or_else(|| "timed out".to_string()),
    };

    TaskStatusRecord {
        task: outcome.task.clone(),
        category: outcome.category,
        criticality: outcome.criticality,
        state: outcome.kind.task_state(),
        progress: if outcome.is_success() { 100 } else { 0 },
        message: Some(message),
        started_at: Some(outcome.started_at),
        finished_at: Some(outcome.finished_at),
        updated_at: outcome.finished_at,
        result: outcome.is_success().then(|| result_payload(outcome)),
        error: outcome.error.clone(),
    }
}

fn execution_record(outcome: &ExecutionOutcome) -> NewExecutionRecord {
    let report = outcome.report.clone().unwrap_or_default();
    let success_rate = report
        .success_rate
        .or_else(|| outcome.is_success().then_some(100.0));

    NewExecutionRecord {
        task: outcome.task.clone(),
        category: outcome.category,
        criticality: outcome.criticality,
        reference_date: outcome.reference_date,
        outcome: outcome.kind,
        elapsed_seconds: outcome.elapsed_seconds,
        records_processed: report.total_records.unwrap_or(0),
        records_valid: report.valid_records.unwrap_or(0),
        records_invalid: report.invalid_records.unwrap_or(0),
        success_rate,
        result: result_payload(outcome),
        executed_at: outcome.finished_at,
    }
}

fn result_payload(outcome: &ExecutionOutcome) -> serde_json::Value {
    json!({
        "status": outcome.kind.as_str(),
        "task": outcome.task,
        "reference_date": outcome.reference_date.to_string(),
        "exit_code": outcome.exit_code,
        "stdout": outcome.stdout,
        "stderr": outcome.stderr,
        "error": outcome.error,
        "report": outcome.report,
        "elapsed_seconds": outcome.elapsed_seconds,
    })
}

fn log_outcome(outcome: &ExecutionOutcome) {
    match outcome.kind {
        OutcomeKind::Success => tracing::info!(
            task = %outcome.task,
            elapsed_secs = outcome.elapsed_seconds,
            "task succeeded"
        ),
        OutcomeKind::Error => tracing::error!(
            task = %outcome.task,
            exit_code = ?outcome.exit_code,
            error = %outcome.error.as_deref().unwrap_or_default(),
            "task failed"
        ),
        OutcomeKind::Timeout => tracing::error!(
            task = %outcome.task,
            error = %outcome.error.as_deref().unwrap_or_default(),
            "task timed out"
        ),
    }
}
