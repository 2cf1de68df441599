//! Bounded waiting on external processes.
//!
//! Platform procedures (reboot, package install) run as child processes.
//! Completion is polled at a fixed interval until a ceiling expressed as a
//! duration; a process still running at the ceiling is killed.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Where a child's stdout and stderr go.
#[derive(Debug, Clone, Copy)]
pub enum OutputTarget<'a> {
    /// Captured and returned in [`ProcessOutcome::Exited`].
    Capture,
    /// Appended to a file.
    File(&'a Path),
}

/// How a bounded process wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The process exited before the ceiling.
    Exited {
        success: bool,
        code: Option<i32>,
        /// Captured output, empty when written to a file.
        output: String,
    },
    /// Still running at the ceiling; it was killed.
    TimedOut,
    /// The process could not be started or polled.
    Failed(String),
}

impl ProcessOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ProcessOutcome::Exited { success: true, .. })
    }

    /// Human readable failure description.
    pub fn describe(&self) -> String {
        match self {
            ProcessOutcome::Exited {
                success: true, ..
            } => "completed".to_string(),
            ProcessOutcome::Exited { code, output, .. } => {
                let output = output.trim();
                match (code, output.is_empty()) {
                    (Some(code), true) => format!("exited with status {}", code),
                    (Some(code), false) => format!("exited with status {}: {}", code, output),
                    (None, true) => "terminated by signal".to_string(),
                    (None, false) => format!("terminated by signal: {}", output),
                }
            }
            ProcessOutcome::TimedOut => "did not complete in time".to_string(),
            ProcessOutcome::Failed(reason) => reason.clone(),
        }
    }
}

/// Run `command` followed by `extra_args`, polling every `poll_interval`
/// until it exits or `timeout` elapses.
pub async fn run_bounded(
    command: &[String],
    extra_args: &[&str],
    output: OutputTarget<'_>,
    timeout: Duration,
    poll_interval: Duration,
) -> ProcessOutcome {
    let Some((program, args)) = command.split_first() else {
        return ProcessOutcome::Failed("empty command".to_string());
    };

    let mut cmd = Command::new(program);
    cmd.args(args).args(extra_args).stdin(Stdio::null()).kill_on_drop(true);
    match output {
        OutputTarget::Capture => {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        OutputTarget::File(path) => {
            let file = match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
            {
                Ok(file) => file,
                Err(e) => return ProcessOutcome::Failed(format!("{}: {}", path.display(), e)),
            };
            let stderr = match file.try_clone() {
                Ok(clone) => clone,
                Err(e) => return ProcessOutcome::Failed(e.to_string()),
            };
            cmd.stdout(Stdio::from(file)).stderr(Stdio::from(stderr));
        }
    }

    debug!(program = %program, "starting process");
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return ProcessOutcome::Failed(format!("{}: {}", program, e)),
    };

    wait_bounded(&mut child, timeout, poll_interval).await
}

/// How long to wait for the output pipes to close once the process exited.
const OUTPUT_GRACE: Duration = Duration::from_secs(1);

async fn wait_bounded(child: &mut Child, timeout: Duration, poll_interval: Duration) -> ProcessOutcome {
    // Pipes are drained while waiting so a chatty child never blocks on a
    // full pipe.
    let mut drains: Vec<JoinHandle<Vec<u8>>> = drain(child.stdout.take())
        .into_iter()
        .chain(drain(child.stderr.take()))
        .collect();

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let output = collect_output(&mut drains).await;
                return ProcessOutcome::Exited {
                    success: status.success(),
                    code: status.code(),
                    output,
                };
            }
            Ok(None) => {
                if Instant::now() >= deadline {
                    if let Err(e) = child.kill().await {
                        warn!("failed to kill process: {}", e);
                    }
                    drains.iter().for_each(JoinHandle::abort);
                    return ProcessOutcome::TimedOut;
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                tokio::time::sleep(poll_interval.min(remaining)).await;
            }
            Err(e) => {
                drains.iter().for_each(JoinHandle::abort);
                return ProcessOutcome::Failed(e.to_string());
            }
        }
    }
}

fn drain<R>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pipe.map(|mut pipe| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Err(e) = pipe.read_to_end(&mut buf).await {
                debug!("reading process output failed: {}", e);
            }
            buf
        })
    })
}

/// Stdout followed by stderr, decoded lossily.
async fn collect_output(drains: &mut [JoinHandle<Vec<u8>>]) -> String {
    let mut text = String::new();
    for handle in drains.iter_mut() {
        match tokio::time::timeout(OUTPUT_GRACE, &mut *handle).await {
            Ok(Ok(bytes)) => text.push_str(&String::from_utf8_lossy(&bytes)),
            Ok(Err(e)) => debug!("output reader failed: {}", e),
            Err(_) => {
                // A background grandchild still holds the pipe open.
                handle.abort();
                debug!("process output still open after exit, ignoring the rest");
            }
        }
    }
    text
}
