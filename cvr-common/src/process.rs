//! OS-process supervision: deadlines, capped capture, process-tree kill.
//!
//! Every external command the pipeline runs goes through this module.
//! Commands execute in their own process group so that package managers and
//! simulator tooling which spawn nested children can be terminated as a
//! unit. Escalation on teardown is TERM → grace period → KILL.
//!
//! No operation here is retried; retry policy belongs to the caller.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Maximum bytes captured per output stream. Overflow truncates rather
/// than crashing the caller.
pub const MAX_CAPTURE_BYTES: usize = 50 * 1024 * 1024;

/// Grace period between TERM and KILL when tearing a process tree down.
pub const TERM_GRACE_PERIOD: Duration = Duration::from_secs(2);

const TRUNCATION_MARKER: &str = "\n[output truncated at 50MB]";

/// Errors from the supervisor itself (the supervised command's own failure
/// is reported through [`CommandOutput`], not here).
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("child process has no captured {stream} pipe")]
    MissingPipe { stream: &'static str },
}

/// Outcome of a supervised command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exited zero within the deadline.
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process died to a signal or was never reaped.
    pub exit_code: Option<i32>,
    /// The deadline fired and the process tree was terminated.
    pub timed_out: bool,
    /// At least one stream hit the capture cap.
    pub truncated: bool,
}

impl CommandOutput {
    /// Merged stdout + stderr, for pattern scans that do not care which
    /// stream a line arrived on.
    pub fn combined(&self) -> String {
        let mut combined = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&self.stderr);
        }
        combined
    }
}

fn shell_command(command: &str, cwd: &Path, env: &[(String, String)]) -> Command {
    let mut cmd = Command::new("bash");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in env {
        cmd.env(key, value);
    }
    // Own process group so the whole tree can be signalled together.
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

/// Read a stream to completion, keeping at most `cap` bytes.
fn capture_stream<R>(reader: R, cap: usize) -> JoinHandle<(Vec<u8>, bool)>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = reader;
        let mut buf = Vec::new();
        let mut chunk = [0u8; 8192];
        let mut truncated = false;
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    if buf.len() < cap {
                        let take = n.min(cap - buf.len());
                        buf.extend_from_slice(&chunk[..take]);
                        if take < n {
                            truncated = true;
                        }
                    } else {
                        truncated = true;
                    }
                }
                Err(_) => break,
            }
        }
        (buf, truncated)
    })
}

/// Signal the child's process group, falling back to the single process
/// when the group signal is unavailable (already reaped, or insufficient
/// privilege).
async fn signal_tree(child: &mut Child, pid: Option<u32>, signal: &str) {
    let group_ok = match pid {
        Some(pid) => Command::new("kill")
            .args(["-s", signal, "--", &format!("-{pid}")])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false),
        None => false,
    };

    if !group_ok {
        debug!(?pid, signal, "group signal unavailable, falling back to single process");
        if signal == "KILL" {
            let _ = child.start_kill();
        } else if let Some(pid) = pid {
            let _ = Command::new("kill")
                .args(["-s", signal, &pid.to_string()])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
        }
    }
}

/// TERM the tree, wait out the grace period, KILL whatever is left, and
/// reap the direct child. Returns the exit status when the child could be
/// reaped.
async fn terminate_tree(child: &mut Child, pid: Option<u32>) -> Option<ExitStatus> {
    signal_tree(child, pid, "TERM").await;
    if let Ok(Ok(status)) = timeout(TERM_GRACE_PERIOD, child.wait()).await {
        return Some(status);
    }

    signal_tree(child, pid, "KILL").await;
    match timeout(TERM_GRACE_PERIOD, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        _ => None,
    }
}

/// Run a shell command with a wall-clock deadline.
///
/// On timeout the whole process group is terminated (TERM, 2s grace,
/// KILL) and the output captured so far is returned with
/// `timed_out = true`. A non-zero exit within the deadline is an ordinary
/// `success = false` outcome, not an error.
pub async fn run_with_timeout(
    command: &str,
    cwd: &Path,
    deadline: Duration,
    env: &[(String, String)],
) -> Result<CommandOutput, SupervisorError> {
    debug!(command, cwd = %cwd.display(), timeout_secs = deadline.as_secs(), "running command");

    let mut child = shell_command(command, cwd, env)
        .spawn()
        .map_err(|source| SupervisorError::Spawn {
            command: command.to_string(),
            source,
        })?;
    let pid = child.id();

    let stdout = child
        .stdout
        .take()
        .ok_or(SupervisorError::MissingPipe { stream: "stdout" })?;
    let stderr = child
        .stderr
        .take()
        .ok_or(SupervisorError::MissingPipe { stream: "stderr" })?;
    let stdout_task = capture_stream(stdout, MAX_CAPTURE_BYTES);
    let stderr_task = capture_stream(stderr, MAX_CAPTURE_BYTES);

    let (status, timed_out) = match timeout(deadline, child.wait()).await {
        Ok(Ok(status)) => (Some(status), false),
        Ok(Err(err)) => {
            warn!(command, error = %err, "failed waiting on child");
            (None, false)
        }
        Err(_) => {
            warn!(
                command,
                timeout_secs = deadline.as_secs(),
                "deadline exceeded, terminating process tree"
            );
            (terminate_tree(&mut child, pid).await, true)
        }
    };

    // A surviving grandchild can hold the pipes open after a failed group
    // kill; never let that wedge the caller.
    let (stdout_buf, stdout_trunc) = collect_capture(stdout_task, timed_out).await;
    let (stderr_buf, stderr_trunc) = collect_capture(stderr_task, timed_out).await;
    let truncated = stdout_trunc || stderr_trunc;

    let mut stdout = String::from_utf8_lossy(&stdout_buf).into_owned();
    if stdout_trunc {
        stdout.push_str(TRUNCATION_MARKER);
    }
    let mut stderr = String::from_utf8_lossy(&stderr_buf).into_owned();
    if stderr_trunc {
        stderr.push_str(TRUNCATION_MARKER);
    }

    let exit_code = status.and_then(|s| s.code());
    Ok(CommandOutput {
        success: !timed_out && status.is_some_and(|s| s.success()),
        stdout,
        stderr,
        exit_code,
        timed_out,
        truncated,
    })
}

async fn collect_capture(task: JoinHandle<(Vec<u8>, bool)>, timed_out: bool) -> (Vec<u8>, bool) {
    if !timed_out {
        return task.await.unwrap_or_default();
    }
    match timeout(TERM_GRACE_PERIOD, task).await {
        Ok(result) => result.unwrap_or_default(),
        Err(_) => (Vec::new(), true),
    }
}

/// Which stream a [`ProcessHandle`] line arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// One line of live output from a long-running process.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub line: String,
}

/// Live handle to a detached long-running process (dev server, log
/// streamer). The owner must call [`ProcessHandle::kill`] on every exit
/// path; the drop guard is a last-resort group KILL, not the plan.
pub struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
    command: String,
    lines: mpsc::UnboundedReceiver<OutputLine>,
    reaped: bool,
}

fn pump_lines<R>(reader: R, stream: OutputStream, tx: mpsc::UnboundedSender<OutputLine>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(OutputLine { stream, line }).is_err() {
                break;
            }
        }
    });
}

/// Spawn a shell command for interactive observation: stdout/stderr are
/// streamed line-by-line and the process stays alive until killed.
pub fn spawn_long_running(
    command: &str,
    cwd: &Path,
    env: &[(String, String)],
) -> Result<ProcessHandle, SupervisorError> {
    debug!(command, cwd = %cwd.display(), "spawning long-running process");

    let mut child = shell_command(command, cwd, env)
        .spawn()
        .map_err(|source| SupervisorError::Spawn {
            command: command.to_string(),
            source,
        })?;
    let pid = child.id();

    let (tx, rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        pump_lines(stdout, OutputStream::Stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        pump_lines(stderr, OutputStream::Stderr, tx);
    }

    Ok(ProcessHandle {
        child,
        pid,
        command: command.to_string(),
        lines: rx,
        reaped: false,
    })
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Next output line; `None` once the process has exited and the pipes
    /// are drained.
    pub async fn next_line(&mut self) -> Option<OutputLine> {
        self.lines.recv().await
    }

    /// Whether the process has exited (without consuming the status).
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Wait up to `limit` for the process to exit on its own.
    pub async fn wait_for_exit(&mut self, limit: Duration) -> Option<ExitStatus> {
        match timeout(limit, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.reaped = true;
                Some(status)
            }
            _ => None,
        }
    }

    /// Terminate the whole process tree: TERM, grace period, KILL, reap.
    pub async fn kill(&mut self) {
        if self.reaped {
            return;
        }
        if let Ok(Some(_)) = self.child.try_wait() {
            // Already exited; still sweep the group for orphans.
            signal_tree(&mut self.child, self.pid, "KILL").await;
            self.reaped = true;
            return;
        }
        debug!(command = %self.command, pid = ?self.pid, "killing process tree");
        if terminate_tree(&mut self.child, self.pid).await.is_some() {
            self.reaped = true;
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.reaped || matches!(self.child.try_wait(), Ok(Some(_))) {
            return;
        }
        // Last-resort synchronous sweep so no exit path leaks the tree;
        // kill_on_drop already covers the direct child.
        if let Some(pid) = self.pid {
            warn!(command = %self.command, pid, "process handle dropped while alive, killing group");
            let _ = std::process::Command::new("kill")
                .args(["-s", "KILL", "--", &format!("-{pid}")])
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .status();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn cwd() -> std::path::PathBuf {
        std::env::temp_dir()
    }

    #[tokio::test]
    async fn successful_command_captures_stdout() {
        let output = run_with_timeout("echo hello", &cwd(), Duration::from_secs(5), &[])
            .await
            .unwrap();
        assert!(output.success);
        assert!(!output.timed_out);
        assert_eq!(output.exit_code, Some(0));
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_failure_not_error() {
        let output = run_with_timeout("exit 3", &cwd(), Duration::from_secs(5), &[])
            .await
            .unwrap();
        assert!(!output.success);
        assert!(!output.timed_out);
        assert_eq!(output.exit_code, Some(3));
    }

    #[tokio::test]
    async fn stderr_is_captured_separately() {
        let output = run_with_timeout(
            "echo out; echo err 1>&2",
            &cwd(),
            Duration::from_secs(5),
            &[],
        )
        .await
        .unwrap();
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert!(output.combined().contains("out"));
        assert!(output.combined().contains("err"));
    }

    #[tokio::test]
    async fn env_vars_are_passed_through() {
        let env = vec![("CVR_TEST_VALUE".to_string(), "marker-42".to_string())];
        let output = run_with_timeout("echo $CVR_TEST_VALUE", &cwd(), Duration::from_secs(5), &env)
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "marker-42");
    }

    #[tokio::test]
    async fn timeout_terminates_within_grace_budget() {
        let started = Instant::now();
        let output = run_with_timeout("sleep 30", &cwd(), Duration::from_millis(200), &[])
            .await
            .unwrap();
        assert!(output.timed_out);
        assert!(!output.success);
        // Deadline + TERM grace + slack, nowhere near the 30s sleep.
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn timeout_kills_nested_children() {
        // The inner sleep is a grandchild; group kill must take it down
        // fast enough that wait() does not block on the shared pipe.
        let started = Instant::now();
        let output = run_with_timeout(
            "bash -c 'sleep 30' & wait",
            &cwd(),
            Duration::from_millis(200),
            &[],
        )
        .await
        .unwrap();
        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn spawn_long_running_streams_lines_and_dies_on_kill() {
        let mut handle = spawn_long_running(
            "echo ready; sleep 30",
            &cwd(),
            &[],
        )
        .unwrap();

        let line = timeout(Duration::from_secs(5), handle.next_line())
            .await
            .expect("line before timeout")
            .expect("stream open");
        assert_eq!(line.line, "ready");
        assert_eq!(line.stream, OutputStream::Stdout);

        handle.kill().await;
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn wait_for_exit_reaps_short_process() {
        let mut handle = spawn_long_running("true", &cwd(), &[]).unwrap();
        let status = handle.wait_for_exit(Duration::from_secs(5)).await;
        assert!(status.is_some_and(|s| s.success()));
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let err = run_with_timeout("true", Path::new("/nonexistent-cvr-dir"), Duration::from_secs(1), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
    }
}
