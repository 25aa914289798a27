//! Isolated grading worker
//!
//! Every submission is graded by a fresh engine process placed in its own
//! process group, so a timeout can take down the engine together with
//! anything the student's code spawned. The engine's stdout is the result
//! channel; see `WorkerReport`.

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{EngineCommand, SubmissionGrader, WorkerReport};
use crate::core::{GradingOutcome, StudentIdentity, SubmissionUnit};

/// How long to wait for the result channel after the engine has exited
pub const DEFAULT_RESULT_GRACE: Duration = Duration::from_secs(5);

/// Maximum stdout kept; only the last non-empty line is the result
const STDOUT_TAIL_BYTES: usize = 1024 * 1024;

/// Maximum stderr kept for failure descriptions
const STDERR_TAIL_BYTES: usize = 4096;

/// Raw result of one engine process
#[derive(Debug)]
enum WorkerRun {
    TimedOut,
    Finished {
        status: ExitStatus,
        /// `None` if the channel was not closed within the grace period
        stdout: Option<String>,
        stderr: String,
    },
    Crashed(String),
}

/// Runs the grading engine once per submission in a separate process
#[derive(Debug, Clone)]
pub struct IsolatedWorker {
    command: EngineCommand,
    result_grace: Duration,
}

impl IsolatedWorker {
    pub fn new(command: EngineCommand) -> Self {
        Self {
            command,
            result_grace: DEFAULT_RESULT_GRACE,
        }
    }

    pub fn with_result_grace(mut self, grace: Duration) -> Self {
        self.result_grace = grace;
        self
    }

    async fn run(
        &self,
        submission: &Path,
        autograder: &Path,
        timeout: Option<Duration>,
    ) -> WorkerRun {
        let args = self.command.render_args(submission, autograder);
        debug!("Running grading engine: {} {:?}", self.command.program, args);

        let mut cmd = Command::new(&self.command.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return WorkerRun::Crashed(format!(
                    "failed to spawn grading engine {:?}: {}",
                    self.command.program, e
                ))
            }
        };
        let pgid = child.id();

        let stdout_task = spawn_reader(child.stdout.take(), STDOUT_TAIL_BYTES);
        let stderr_task = spawn_reader(child.stderr.take(), STDERR_TAIL_BYTES);

        let waited = match timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(waited) => waited,
                Err(_) => {
                    kill_group(pgid, &mut child).await;
                    stdout_task.abort();
                    stderr_task.abort();
                    return WorkerRun::TimedOut;
                }
            },
            None => child.wait().await,
        };

        let status = match waited {
            Ok(status) => status,
            Err(e) => {
                kill_group(pgid, &mut child).await;
                return WorkerRun::Crashed(format!("failed to wait for grading engine: {}", e));
            }
        };

        // A descendant may still hold the pipe open; never block on it
        let stdout = match tokio::time::timeout(self.result_grace, stdout_task).await {
            Ok(Ok(bytes)) => Some(String::from_utf8_lossy(&bytes).into_owned()),
            Ok(Err(e)) => {
                warn!("Result reader for {:?} failed: {}", submission, e);
                None
            }
            Err(_) => {
                warn!(
                    "Result channel for {:?} still open {:?} after engine exit",
                    submission, self.result_grace
                );
                None
            }
        };
        kill_group(pgid, &mut child).await;

        let stderr = match tokio::time::timeout(self.result_grace, stderr_task).await {
            Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
            _ => String::new(),
        };

        WorkerRun::Finished {
            status,
            stdout,
            stderr,
        }
    }
}

#[async_trait]
impl SubmissionGrader for IsolatedWorker {
    async fn grade_one(
        &self,
        submission: &SubmissionUnit,
        autograder_definition: &Path,
        timeout: Option<Duration>,
    ) -> GradingOutcome {
        let identity = submission.identity.clone();

        match self
            .run(&submission.archive_path, autograder_definition, timeout)
            .await
        {
            WorkerRun::TimedOut => {
                info!("Grading {} timed out after {:?}", identity, timeout);
                GradingOutcome::Timeout { identity }
            }
            WorkerRun::Crashed(error_description) => GradingOutcome::Failure {
                identity,
                error_description,
            },
            WorkerRun::Finished {
                status,
                stdout,
                stderr,
            } => interpret(identity, status, stdout, &stderr),
        }
    }
}

fn interpret(
    identity: StudentIdentity,
    status: ExitStatus,
    stdout: Option<String>,
    stderr: &str,
) -> GradingOutcome {
    let failure = |error_description: String| GradingOutcome::Failure {
        identity: identity.clone(),
        error_description,
    };

    let Some(stdout) = stdout else {
        return failure(with_stderr(
            format!("no result received from grading engine ({})", status),
            stderr,
        ));
    };

    match WorkerReport::from_stdout(&stdout) {
        Some(Ok(WorkerReport::Graded { questions })) => {
            match WorkerReport::into_scores(questions) {
                Ok(questions) => GradingOutcome::Success {
                    identity: identity.clone(),
                    questions,
                },
                Err(e) => failure(e),
            }
        }
        Some(Ok(WorkerReport::Error { message })) => failure(message),
        Some(Err(e)) => failure(with_stderr(
            format!("unreadable result from grading engine ({}): {}", status, e),
            stderr,
        )),
        None => failure(with_stderr(
            format!("grading engine exited ({}) without reporting a result", status),
            stderr,
        )),
    }
}

fn with_stderr(message: String, stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        message
    } else {
        format!("{}: {}", message, stderr)
    }
}

/// Read a stream to its end, keeping at most the last `keep` bytes
fn spawn_reader<R>(reader: Option<R>, keep: usize) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut collected = Vec::new();
        let Some(mut reader) = reader else {
            return collected;
        };
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    collected.extend_from_slice(&chunk[..n]);
                    if collected.len() > keep {
                        let excess = collected.len() - keep;
                        collected.drain(..excess);
                    }
                }
            }
        }
        collected
    })
}

/// SIGKILL the whole process group and reap the direct child
async fn kill_group(pgid: Option<u32>, child: &mut Child) {
    if let Some(pgid) = pgid.and_then(|id| i32::try_from(id).ok()) {
        match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!("Failed to kill process group {}: {}", pgid, e),
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}
