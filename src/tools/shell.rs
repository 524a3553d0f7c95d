//! Shell command tool.
//!
//! Runs `sh -c <command>` in the project root. Output is read concurrently
//! while the child runs so a chatty command cannot fill a pipe and stall;
//! at most `output_limit_bytes` per stream are kept, the rest is drained and
//! counted. The command runs in its own process group, and the whole group
//! is killed on timeout or cancellation.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::types::RunCommandArgs;
use super::{schema_for, ProgressSink, Tool, ToolArguments, ToolContext, ToolOutput, RUN_COMMAND};
use crate::error::ToolError;

/// How long to keep reading output after the child is gone. Grandchildren
/// may hold the pipes open.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Longest run of bytes without a newline held before it is passed on as a
/// chunk of its own.
const MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug, Default)]
struct CapturedStream {
    bytes: Vec<u8>,
    truncated: usize,
}

impl CapturedStream {
    fn push(&mut self, chunk: &[u8], limit: usize) {
        let room = limit.saturating_sub(self.bytes.len());
        let kept = room.min(chunk.len());
        self.bytes.extend_from_slice(&chunk[..kept]);
        self.truncated += chunk.len() - kept;
    }

    fn render(&self, label: &str) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.truncated > 0 {
            text.push_str(&format!("\n[{} truncated {} bytes]", label, self.truncated));
        }
        text
    }
}

enum Ending {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

pub struct ShellTool {
    working_dir: PathBuf,
    max_timeout: Duration,
    output_limit_bytes: usize,
}

impl ShellTool {
    pub fn new(working_dir: PathBuf, max_timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            working_dir,
            max_timeout,
            output_limit_bytes,
        }
    }

    async fn run(
        &self,
        ctx: &ToolContext,
        args: &ToolArguments,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<ToolOutput, ToolError> {
        let command = args.require_str("command")?.trim().to_string();
        let timeout = match args.u64("timeout_secs")? {
            Some(0) => return Err(ToolError::invalid("timeout_secs", "must be at least 1")),
            Some(secs) => Duration::from_secs(secs).min(self.max_timeout),
            None => self.max_timeout,
        };

        info!("🐚 Running command: {}", command);
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&command)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        let mut child = cmd
            .spawn()
            .map_err(|e| ToolError::Failed(format!("Failed to spawn '{}': {}", command, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ToolError::Failed("stdout was not piped".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ToolError::Failed("stderr was not piped".to_string()))?;

        let limit = self.output_limit_bytes;
        let call_id = ctx.call_id();
        let deadline = Instant::now() + timeout;
        let mut stdout_buf = CapturedStream::default();
        let mut stderr_buf = CapturedStream::default();

        let ending = {
            let readers = async {
                tokio::join!(
                    read_stream_limited(stdout, &mut stdout_buf, limit, call_id, progress),
                    read_stream_limited(stderr, &mut stderr_buf, limit, call_id, progress),
                )
            };
            tokio::pin!(readers);

            let mut drained = false;
            let ending = loop {
                tokio::select! {
                    _ = &mut readers, if !drained => drained = true,
                    status = child.wait() => break Ending::Exited(status),
                    _ = tokio::time::sleep_until(deadline) => break Ending::TimedOut,
                    _ = ctx.cancel.cancelled() => break Ending::Cancelled,
                }
            };

            if !matches!(ending, Ending::Exited(_)) {
                kill_process_group(&child);
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill command '{}': {}", command, e);
                }
            }
            if !drained && tokio::time::timeout(DRAIN_GRACE, &mut readers).await.is_err() {
                debug!("Output still open after exit; keeping what was read");
            }
            ending
        };

        let output = format!(
            "Stdout:\n{}\nStderr:\n{}",
            stdout_buf.render("stdout"),
            stderr_buf.render("stderr")
        );

        match ending {
            Ending::Exited(Ok(status)) => {
                let code = status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "terminated by signal".to_string());
                debug!("Command '{}' finished with exit code {}", command, code);
                Ok(ToolOutput::text(format!("Exit code: {}\n{}", code, output)))
            }
            Ending::Exited(Err(e)) => Err(ToolError::Failed(format!(
                "Failed to wait for '{}': {}",
                command, e
            ))),
            Ending::TimedOut => {
                warn!("Command '{}' timed out after {}s", command, timeout.as_secs());
                Err(ToolError::TimedOut {
                    timeout_secs: timeout.as_secs(),
                    output,
                })
            }
            Ending::Cancelled => {
                info!("Command '{}' cancelled", command);
                Err(ToolError::Cancelled)
            }
        }
    }
}

/// SIGKILL every process in the child's group. The shell leads the group,
/// so its pid is the group id.
#[cfg(unix)]
fn kill_process_group(child: &Child) {
    let Some(pid) = child.id() else {
        return;
    };
    // SAFETY: kill(2) has no memory effects; a stale group id only yields ESRCH
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
    if rc != 0 {
        debug!(
            "Process group {} already gone: {}",
            pid,
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}

/// Read `reader` to the end, passing each line (or each [`MAX_LINE_BYTES`]
/// run without a newline) to `progress` and `sink`.
async fn read_stream_limited<R: AsyncRead + Unpin>(
    reader: R,
    sink: &mut CapturedStream,
    limit: usize,
    call_id: &str,
    progress: Option<&dyn ProgressSink>,
) {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    let mut flush = |line: &mut Vec<u8>| {
        if let Some(progress) = progress {
            progress.report(call_id, &String::from_utf8_lossy(line));
        }
        sink.push(line, limit);
        line.clear();
    };

    loop {
        let available = match reader.fill_buf().await {
            Ok(available) => available,
            Err(e) => {
                debug!("Error reading command output: {}", e);
                break;
            }
        };
        if available.is_empty() {
            break;
        }
        let end = available
            .iter()
            .position(|b| *b == b'\n')
            .map_or(available.len(), |i| i + 1)
            .min(MAX_LINE_BYTES - line.len());
        line.extend_from_slice(&available[..end]);
        reader.consume(end);

        if line.ends_with(b"\n") || line.len() >= MAX_LINE_BYTES {
            flush(&mut line);
        }
    }
    if !line.is_empty() {
        flush(&mut line);
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        RUN_COMMAND
    }

    fn description(&self) -> &str {
        "Run a shell command in the project root and return its exit code, stdout and stderr."
    }

    fn parameters(&self) -> Value {
        schema_for::<RunCommandArgs>()
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        args: &ToolArguments,
    ) -> Result<ToolOutput, ToolError> {
        self.run(ctx, args, None).await
    }

    async fn execute_streaming(
        &self,
        ctx: &ToolContext,
        args: &ToolArguments,
        progress: &dyn ProgressSink,
    ) -> Result<ToolOutput, ToolError> {
        self.run(ctx, args, Some(progress)).await
    }
}
