//! Stage execution.
//!
//! [`ProcessStageRunner`] runs a stage's command as a child process under a
//! hard timeout. Output is streamed line by line into the log and only the
//! last lines of each stream are kept. Lines matching the error marker are
//! logged at error level whatever the exit status turns out to be.

use super::outcome::{OutputTail, StageOutcome};
use super::stage::Stage;
use crate::errors::{Result, ShopflowError};
use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lines kept per output stream by default.
pub const DEFAULT_TAIL_LINES: usize = 50;

/// Default pattern for lines logged at error level.
pub const DEFAULT_ERROR_MARKER: &str = r"(?i)\b(error|exception|traceback)\b";

/// How long output readers may keep running after the process has exited.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Executes one stage and reports how it finished.
#[async_trait]
pub trait StageRunner: Send + Sync {
    /// Runs `stage` to completion or timeout. Never fails; every problem is
    /// reported through the outcome.
    async fn run(&self, stage: &Stage) -> StageOutcome;
}

/// Bounded buffer keeping the most recent lines.
#[derive(Debug, Clone, Default)]
pub struct LineTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LineTail {
    /// Creates a buffer holding at most `capacity` lines.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Appends a line, evicting the oldest when full.
    pub fn push(&mut self, line: String) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// Number of lines held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// True when no lines are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Lines held, oldest first.
    #[must_use]
    pub fn to_vec(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

enum Completion {
    Exited(ExitStatus),
    WaitFailed(std::io::Error),
    TimedOut,
}

/// Runs stages as child processes.
#[derive(Debug, Clone)]
pub struct ProcessStageRunner {
    tail_lines: usize,
    error_marker: Regex,
    drain_grace: Duration,
}

impl ProcessStageRunner {
    /// Creates a runner with a compiled error marker.
    #[must_use]
    pub fn new(tail_lines: usize, error_marker: Regex) -> Self {
        Self {
            tail_lines,
            error_marker,
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }

    /// Creates a runner, compiling `pattern` as the error marker.
    pub fn with_pattern(tail_lines: usize, pattern: &str) -> Result<Self> {
        let marker = Regex::new(pattern)
            .map_err(|e| ShopflowError::config(format!("invalid error marker '{pattern}': {e}")))?;
        Ok(Self::new(tail_lines, marker))
    }

    /// Sets how long to wait for output readers after exit.
    #[must_use]
    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    fn spawn_reader<R>(
        &self,
        reader: Option<R>,
        stage: &str,
        stream: OutputStream,
        tail: &Arc<Mutex<LineTail>>,
    ) -> Option<JoinHandle<()>>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let reader = reader?;
        let stage = stage.to_string();
        let tail = Arc::clone(tail);
        let marker = self.error_marker.clone();
        Some(tokio::spawn(capture_lines(reader, stage, stream, tail, marker)))
    }

    async fn drain(&self, readers: Vec<JoinHandle<()>>) {
        let deadline = tokio::time::Instant::now() + self.drain_grace;
        for mut handle in readers {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                debug!("Output stream still open after exit, abandoning reader");
                handle.abort();
            }
        }
    }
}

async fn capture_lines<R>(reader: R, stage: String, stream: OutputStream, tail: Arc<Mutex<LineTail>>, marker: Regex)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(&['\n', '\r'][..])
                    .to_string();
                if marker.is_match(&line) {
                    error!(stage = %stage, stream = stream.as_str(), "{}", line);
                } else {
                    debug!(stage = %stage, stream = stream.as_str(), "{}", line);
                }
                tail.lock().push(line);
            }
            Err(e) => {
                warn!(stage = %stage, stream = stream.as_str(), error = %e, "Failed to read stage output");
                break;
            }
        }
    }
}

#[async_trait]
impl StageRunner for ProcessStageRunner {
    async fn run(&self, stage: &Stage) -> StageOutcome {
        let started = Instant::now();
        let spec = &stage.command;

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        info!(stage = %stage.name, command = %spec.display_line(), timeout_secs = stage.timeout.as_secs(), "Starting stage");

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(stage = %stage.name, program = %spec.program, error = %e, "Failed to start stage");
                return StageOutcome::crashed(
                    format!("failed to start '{}': {e}", spec.program),
                    started.elapsed(),
                    OutputTail::default(),
                );
            }
        };

        let stdout_tail = Arc::new(Mutex::new(LineTail::new(self.tail_lines)));
        let stderr_tail = Arc::new(Mutex::new(LineTail::new(self.tail_lines)));
        let readers: Vec<JoinHandle<()>> = [
            self.spawn_reader(child.stdout.take(), &stage.name, OutputStream::Stdout, &stdout_tail),
            self.spawn_reader(child.stderr.take(), &stage.name, OutputStream::Stderr, &stderr_tail),
        ]
        .into_iter()
        .flatten()
        .collect();

        let completion = match tokio::time::timeout(stage.timeout, child.wait()).await {
            Ok(Ok(status)) => Completion::Exited(status),
            Ok(Err(e)) => Completion::WaitFailed(e),
            Err(_) => {
                warn!(stage = %stage.name, timeout_secs = stage.timeout.as_secs_f64(), "Stage timed out, killing process");
                if let Err(e) = child.kill().await {
                    warn!(stage = %stage.name, error = %e, "Failed to kill timed out stage");
                }
                Completion::TimedOut
            }
        };

        self.drain(readers).await;

        let output_tail = OutputTail {
            stdout: stdout_tail.lock().to_vec(),
            stderr: stderr_tail.lock().to_vec(),
        };
        let duration = started.elapsed();

        match completion {
            Completion::Exited(status) => match status.code() {
                Some(0) => StageOutcome::succeeded(duration, output_tail),
                Some(code) => StageOutcome::failed(code, duration, output_tail),
                None => StageOutcome::crashed(format!("terminated abnormally ({status})"), duration, output_tail),
            },
            Completion::WaitFailed(e) => {
                StageOutcome::crashed(format!("failed to wait for process: {e}"), duration, output_tail)
            }
            Completion::TimedOut => StageOutcome::timed_out(duration, output_tail),
        }
    }
}
