use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{ProcessOutput, ToolInvocationError};
use crate::cancel::StopHandle;
use crate::config::EngineConfig;

/// Per-invocation limits for a subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecLimits {
    pub timeout: Duration,
    pub kill_grace: Duration,
    pub output_limit: usize,
}

impl ExecLimits {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            timeout: config.command_timeout(),
            kill_grace: config.kill_grace(),
            output_limit: config.output_limit_bytes,
        }
    }

    pub fn with_timeout_secs(mut self, secs: Option<u64>) -> Self {
        if let Some(secs) = secs {
            self.timeout = Duration::from_secs(secs);
        }
        self
    }
}

/// Captured `(kept, dropped)` bytes for stdout and stderr.
type Captured = ((Vec<u8>, usize), (Vec<u8>, usize));

enum Ending {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

/// Run `command` through the platform shell inside `workdir`.
///
/// A nonzero exit is a normal result. Only launch failure, timeout and
/// cancellation are errors; the latter two terminate the process first.
/// A background process that keeps the output pipes open after the shell
/// exits is terminated with its group once the deadline passes, and the
/// output captured so far is returned.
pub async fn run_command(
    command: &str,
    workdir: &Path,
    env: &BTreeMap<String, String>,
    limits: ExecLimits,
    stop: &StopHandle,
) -> Result<ProcessOutput, ToolInvocationError> {
    if stop.is_stopped() {
        return Err(ToolInvocationError::Cancelled);
    }

    let mut cmd = shell(command);
    cmd.current_dir(workdir)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let start = Instant::now();
    let deadline = tokio::time::Instant::now() + limits.timeout;
    let mut child = cmd
        .spawn()
        .map_err(|e| ToolInvocationError::Launch(format!("{command}: {e}")))?;
    let pid = child.id();
    debug!(command = %command, pid = ?pid, "process spawned");

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let limit = limits.output_limit;
    let mut captures: JoinHandle<Captured> =
        tokio::spawn(async move { tokio::join!(capture(stdout, limit), capture(stderr, limit)) });

    let ending = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => Ending::Exited(status),
            Err(e) => return Err(ToolInvocationError::Launch(format!("{command}: {e}"))),
        },
        _ = tokio::time::sleep_until(deadline) => Ending::TimedOut,
        _ = stop.stopped() => Ending::Cancelled,
    };

    let status = match ending {
        Ending::Exited(status) => status,
        Ending::TimedOut | Ending::Cancelled => {
            terminate(&mut child, limits.kill_grace).await;
            captures.abort();
            return Err(match ending {
                Ending::TimedOut => ToolInvocationError::Timeout {
                    timeout_secs: limits.timeout.as_secs(),
                },
                _ => ToolInvocationError::Cancelled,
            });
        }
    };

    let drained = tokio::select! {
        out = &mut captures => Ok(out.unwrap_or_default()),
        _ = tokio::time::sleep_until(deadline) => Err(false),
        _ = stop.stopped() => Err(true),
    };
    let ((stdout, stdout_truncated), (stderr, stderr_truncated)) = match drained {
        Ok(out) => out,
        Err(cancelled) => {
            warn!(command = %command, "output still held open after exit; terminating process group");
            let out = reap_group(pid, &mut captures, limits.kill_grace).await;
            if cancelled {
                return Err(ToolInvocationError::Cancelled);
            }
            out
        }
    };

    Ok(ProcessOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        duration_ms: start.elapsed().as_millis() as u64,
        stdout_truncated,
        stderr_truncated,
    })
}

#[cfg(unix)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

/// Read a stream to the end, keeping at most `limit` bytes.
async fn capture<R>(reader: Option<R>, limit: usize) -> (Vec<u8>, usize)
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return (Vec::new(), 0);
    };
    let mut kept = Vec::new();
    let mut dropped = 0usize;
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = limit.saturating_sub(kept.len());
                let take = n.min(room);
                kept.extend_from_slice(&buf[..take]);
                dropped += n - take;
            }
        }
    }
    (kept, dropped)
}

/// Ask the process group to terminate, then force-kill after `grace`.
async fn terminate(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        signal_group(pid, "-TERM").await;
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
        signal_group(pid, "-KILL").await;
    }
    let _ = child.kill().await;
}

/// Signal a group whose leader already exited until its members release the
/// capture pipes.
async fn reap_group(pid: Option<u32>, captures: &mut JoinHandle<Captured>, grace: Duration) -> Captured {
    for signal in ["-TERM", "-KILL"] {
        if let Some(pid) = pid {
            signal_group(pid, signal).await;
        }
        if let Ok(out) = tokio::time::timeout(grace, &mut *captures).await {
            return out.unwrap_or_default();
        }
    }
    captures.abort();
    Default::default()
}

#[cfg(unix)]
async fn signal_group(pid: u32, signal: &str) {
    let group = format!("-{pid}");
    let _ = Command::new("kill")
        .args([signal, "--", group.as_str()])
        .status()
        .await;
}

#[cfg(not(unix))]
async fn signal_group(_pid: u32, _signal: &str) {}
