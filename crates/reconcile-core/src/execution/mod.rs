pub mod tokio_process;

pub use tokio_process::TokioProcessExecutor;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::models::{CoreError, CoreErrorKind};

pub type ExecutionResult<T> = Result<T, CoreError>;

pub type ProcessWaitFuture = Pin<Box<dyn Future<Output = ExecutionResult<ProcessOutput>> + Send>>;

/// Program, arguments and working directory of one task process.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    /// Runs `entry_point` directly, or as the first argument of
    /// `interpreter` when one is configured.
    pub fn for_entry_point(entry_point: &Path, interpreter: Option<&Path>) -> Self {
        match interpreter {
            Some(interpreter) => Self::new(interpreter).arg(entry_point.to_string_lossy()),
            None => Self::new(entry_point),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, working_dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(working_dir.into());
        self
    }

    fn check(&self, task: &str) -> ExecutionResult<()> {
        if self.program.as_os_str().is_empty() {
            return Err(invalid_input(task, "task has no program to launch"));
        }
        if let Some(arg) = self.args.iter().find(|arg| arg.is_empty() || arg.contains('\0')) {
            return Err(invalid_input(
                task,
                format!("task argument {arg:?} is empty or contains a NUL byte"),
            ));
        }
        Ok(())
    }
}

/// Everything needed to launch one task run: the command plus the limits
/// that end it early.
#[derive(Clone, Debug)]
pub struct ProcessSpawnRequest {
    pub task: String,
    pub command: CommandSpec,
    pub timeout: Option<Duration>,
    pub cancellation: Option<CancellationToken>,
}

impl ProcessSpawnRequest {
    pub fn new(task: impl Into<String>, command: CommandSpec) -> Self {
        Self {
            task: task.into(),
            command,
            timeout: None,
            cancellation: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn validate(&self) -> ExecutionResult<()> {
        if self.task.trim().is_empty() {
            return Err(invalid_input(&self.task, "task name must not be blank"));
        }
        if self.timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(invalid_input(&self.task, "task timeout must be positive"));
        }
        self.command.check(&self.task)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessExitStatus {
    ExitCode(i32),
    /// Ended by a signal, so no exit code exists.
    Terminated,
}

/// Exit status plus everything the task wrote before it exited.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessOutput {
    pub status: ProcessExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

pub trait RunningProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Resolves once the process exits. A configured timeout or a fired
    /// cancellation token kills the process group and resolves to a
    /// `Timeout` or `Cancelled` error respectively.
    fn wait(self: Box<Self>) -> ProcessWaitFuture;
}

pub trait ProcessExecutor: Send + Sync {
    fn spawn(&self, request: ProcessSpawnRequest) -> ExecutionResult<Box<dyn RunningProcess>>;
}

pub fn spawn_validated(
    executor: &dyn ProcessExecutor,
    request: ProcessSpawnRequest,
) -> ExecutionResult<Box<dyn RunningProcess>> {
    request.validate()?;
    executor.spawn(request)
}

fn invalid_input(task: &str, message: impl Into<String>) -> CoreError {
    CoreError::for_task(task, CoreErrorKind::InvalidInput, message)
}
