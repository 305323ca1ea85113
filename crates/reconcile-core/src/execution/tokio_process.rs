use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::execution::{
    ExecutionResult, ProcessExecutor, ProcessExitStatus, ProcessOutput, ProcessSpawnRequest,
    ProcessWaitFuture, RunningProcess,
};
use crate::models::{CoreError, CoreErrorKind};

const REAP_WINDOW: Duration = Duration::from_secs(1);
const OUTPUT_READ_WINDOW: Duration = Duration::from_millis(250);
const READ_CHUNK: usize = 8 * 1024;

/// Spawns each task in its own process group so a timeout, a cancellation
/// or a normal exit can take down every descendant it left behind.
pub struct TokioProcessExecutor;

impl ProcessExecutor for TokioProcessExecutor {
    fn spawn(&self, request: ProcessSpawnRequest) -> ExecutionResult<Box<dyn RunningProcess>> {
        let ProcessSpawnRequest {
            task,
            command,
            timeout,
            cancellation,
        } = request;

        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(|error| {
            process_failure(
                &task,
                format!("failed to spawn '{}': {error}", command.program.display()),
            )
        })?;

        Ok(Box::new(TaskProcess {
            pid: child.id(),
            child,
            timeout,
            cancellation,
            task,
        }))
    }
}

struct TaskProcess {
    child: Child,
    pid: Option<u32>,
    timeout: Option<Duration>,
    cancellation: Option<CancellationToken>,
    task: String,
}

enum Interruption {
    TimedOut(Duration),
    Cancelled,
}

impl RunningProcess for TaskProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn wait(self: Box<Self>) -> ProcessWaitFuture {
        let TaskProcess {
            mut child,
            pid,
            timeout,
            cancellation,
            task,
        } = *self;

        Box::pin(async move {
            let stdout = PipeCapture::start(child.stdout.take());
            let stderr = PipeCapture::start(child.stderr.take());

            let status = tokio::select! {
                result = child.wait() => result.map_err(|error| {
                    process_failure(&task, format!("failed to wait for process: {error}"))
                })?,
                interruption = interrupted(timeout, cancellation.as_ref()) => {
                    kill_group(&task, pid);
                    let _ = child.start_kill();
                    let _ = tokio::time::timeout(REAP_WINDOW, child.wait()).await;
                    stdout.abort();
                    stderr.abort();
                    return Err(interruption.into_error(task));
                }
            };

            // Descendants still holding the pipes would keep the readers open.
            kill_group(&task, pid);

            Ok(ProcessOutput {
                status: match status.code() {
                    Some(code) => ProcessExitStatus::ExitCode(code),
                    None => ProcessExitStatus::Terminated,
                },
                stdout: stdout.finish().await,
                stderr: stderr.finish().await,
            })
        })
    }
}

impl Interruption {
    fn into_error(self, task: String) -> CoreError {
        match self {
            Self::TimedOut(limit) => CoreError::for_task(
                task,
                CoreErrorKind::Timeout,
                format!("process timed out after {}ms", limit.as_millis()),
            ),
            Self::Cancelled => CoreError::for_task(
                task,
                CoreErrorKind::Cancelled,
                "process terminated by cancellation",
            ),
        }
    }
}

async fn interrupted(
    timeout: Option<Duration>,
    cancellation: Option<&CancellationToken>,
) -> Interruption {
    match (timeout, cancellation) {
        (Some(limit), Some(token)) => tokio::select! {
            _ = tokio::time::sleep(limit) => Interruption::TimedOut(limit),
            _ = token.cancelled() => Interruption::Cancelled,
        },
        (Some(limit), None) => {
            tokio::time::sleep(limit).await;
            Interruption::TimedOut(limit)
        }
        (None, Some(token)) => {
            token.cancelled().await;
            Interruption::Cancelled
        }
        (None, None) => std::future::pending().await,
    }
}

/// Drains one pipe into a shared buffer so that bytes read before the
/// reader is abandoned are still returned.
struct PipeCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    reader: JoinHandle<()>,
}

impl PipeCapture {
    fn start<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = buffer.clone();
        let reader = tokio::spawn(async move {
            let Some(mut pipe) = pipe else {
                return;
            };
            let mut chunk = vec![0u8; READ_CHUNK];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(read) => {
                        sink.lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .extend_from_slice(&chunk[..read]);
                    }
                }
            }
        });
        Self { buffer, reader }
    }

    async fn finish(self) -> Vec<u8> {
        let Self { buffer, mut reader } = self;
        if tokio::time::timeout(OUTPUT_READ_WINDOW, &mut reader)
            .await
            .is_err()
        {
            reader.abort();
        }
        std::mem::take(&mut *buffer.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn abort(self) {
        self.reader.abort();
    }
}

fn kill_group(task: &str, pid: Option<u32>) {
    let Some(pid) = pid else {
        return;
    };
    if let Err(error) = signal_process_group(pid, libc::SIGKILL) {
        tracing::warn!(task = %task, pid, error = %error, "failed to kill task process group");
    }
}

fn signal_process_group(pid: u32, signal: libc::c_int) -> Result<(), std::io::Error> {
    let pgid = -(pid as libc::pid_t);
    let result = unsafe { libc::kill(pgid, signal) };

    if result != 0 {
        let os_error = std::io::Error::last_os_error();
        if os_error.raw_os_error() != Some(libc::ESRCH) {
            return Err(os_error);
        }
    }

    Ok(())
}

fn process_failure(task: &str, message: String) -> CoreError {
    CoreError::for_task(task, CoreErrorKind::ProcessFailure, message)
}
