//! Poll-based remote command execution through the provider's command
//! service. No network session to the instance is ever opened.

pub mod scripts;

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::{debug, info};

use crate::progress::ProgressSink;
use crate::provider::{
    CommandApi, InvocationSnapshot, InvocationStatus, ProviderError, ProviderErrorKind,
};

/// Poll interval for long operations such as package installation.
pub const LONG_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Poll interval for short probes and queries.
pub const SHORT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Timeout and poll interval for one command.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CommandTiming {
    /// Wall-clock limit after which the command counts as timed out.
    pub timeout: Duration,
    /// Delay between status polls.
    pub poll_interval: Duration,
}

impl CommandTiming {
    /// Timing for long-running commands.
    #[must_use]
    pub const fn long_running(timeout: Duration) -> Self {
        Self {
            timeout,
            poll_interval: LONG_POLL_INTERVAL,
        }
    }

    /// Timing for short commands.
    #[must_use]
    pub const fn short(timeout: Duration) -> Self {
        Self {
            timeout,
            poll_interval: SHORT_POLL_INTERVAL,
        }
    }

    /// Overrides the poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Terminal status of a remote command.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StepStatus {
    /// Exited with status zero.
    Succeeded,
    /// Ran and exited non-zero.
    Failed,
    /// Cancelled before completion.
    Cancelled,
    /// Did not finish in time.
    TimedOut,
}

impl StepStatus {
    /// Lower-case label for messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed-out",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one remote command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StepResult {
    /// `true` only when the command succeeded.
    pub success: bool,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Terminal status.
    pub status: StepStatus,
}

impl StepResult {
    fn from_snapshot(snapshot: InvocationSnapshot) -> Self {
        let status = match snapshot.status {
            InvocationStatus::Success => StepStatus::Succeeded,
            InvocationStatus::Cancelled | InvocationStatus::Cancelling => StepStatus::Cancelled,
            InvocationStatus::TimedOut => StepStatus::TimedOut,
            _ => StepStatus::Failed,
        };
        Self {
            success: status == StepStatus::Succeeded,
            stdout: snapshot.stdout,
            stderr: snapshot.stderr,
            status,
        }
    }

    /// Standard output followed by standard error.
    #[must_use]
    pub fn combined_output(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }

    /// Short description of a failed result for error messages.
    #[must_use]
    pub fn failure_detail(&self) -> String {
        let detail = if self.stderr.trim().is_empty() {
            last_lines(&self.stdout, 5)
        } else {
            last_lines(&self.stderr, 5)
        };
        if detail.is_empty() {
            format!("command {}", self.status)
        } else {
            detail
        }
    }
}

fn last_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|line| !line.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(count);
    lines.get(start..).unwrap_or_default().join("\n")
}

/// Failures that prevent a command result from being observed at all.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ChannelError {
    /// The provider refused to dispatch the command.
    #[error("failed to dispatch command to {instance_id}: {source}")]
    Dispatch {
        /// Target instance.
        instance_id: String,
        /// Provider error.
        #[source]
        source: ProviderError,
    },
    /// Status polling failed with a non-transient error.
    #[error("failed to read status of command {command_id}: {source}")]
    Poll {
        /// Command handle being polled.
        command_id: String,
        /// Provider error.
        #[source]
        source: ProviderError,
    },
}

/// Executes shell commands on instances through a [`CommandApi`].
#[derive(Debug)]
pub struct CommandChannel<'p, C: ?Sized> {
    api: &'p C,
}

impl<'p, C: CommandApi + ?Sized> CommandChannel<'p, C> {
    /// Wraps a command-capable provider.
    #[must_use]
    pub const fn new(api: &'p C) -> Self {
        Self { api }
    }

    /// Dispatches `script` and polls until it finishes or `timing.timeout`
    /// elapses. Output lines are forwarded to `sink` as polls reveal them.
    ///
    /// A timeout is reported as a failed [`StepResult`] with
    /// [`StepStatus::TimedOut`], not as an error.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Dispatch`] when no command handle could be
    /// obtained and [`ChannelError::Poll`] when polling fails permanently.
    pub async fn execute(
        &self,
        instance_id: &str,
        script: &str,
        timing: CommandTiming,
        sink: &dyn ProgressSink,
    ) -> Result<StepResult, ChannelError> {
        let command_id = self
            .api
            .send_command(instance_id, script, timing.timeout.as_secs())
            .await
            .map_err(|source| ChannelError::Dispatch {
                instance_id: instance_id.to_owned(),
                source,
            })?;
        debug!(instance_id, command_id, "command dispatched");

        let deadline = Instant::now() + timing.timeout;
        let mut cursor = LineCursor::default();
        let mut latest_stdout = String::new();

        loop {
            sleep(timing.poll_interval).await;
            match self.api.get_invocation(&command_id, instance_id).await {
                Ok(snapshot) => {
                    cursor.forward_complete(&snapshot.stdout, sink);
                    if snapshot.status.is_terminal() {
                        cursor.forward_rest(&snapshot.stdout, sink);
                        for line in snapshot.stderr.lines().filter(|l| !l.trim().is_empty()) {
                            sink.log(line);
                        }
                        return Ok(StepResult::from_snapshot(snapshot));
                    }
                    latest_stdout = snapshot.stdout;
                }
                // The invocation record appears shortly after dispatch.
                Err(err)
                    if matches!(
                        err.kind,
                        ProviderErrorKind::Unavailable | ProviderErrorKind::Throttled
                    ) =>
                {
                    debug!(command_id, error = %err, "command status not available yet");
                }
                Err(source) => return Err(ChannelError::Poll { command_id, source }),
            }

            if Instant::now() >= deadline {
                info!(instance_id, command_id, "command timed out");
                return Ok(StepResult {
                    success: false,
                    stdout: latest_stdout,
                    stderr: format!(
                        "command {command_id} did not finish within {}s",
                        timing.timeout.as_secs()
                    ),
                    status: StepStatus::TimedOut,
                });
            }
        }
    }
}

/// Tracks how many complete output lines have been forwarded.
#[derive(Debug, Default)]
struct LineCursor {
    forwarded: usize,
}

impl LineCursor {
    fn forward_complete(&mut self, text: &str, sink: &dyn ProgressSink) {
        let complete: Vec<&str> = text
            .split_inclusive('\n')
            .filter(|line| line.ends_with('\n'))
            .collect();
        self.emit(&complete, sink);
    }

    fn forward_rest(&mut self, text: &str, sink: &dyn ProgressSink) {
        let all: Vec<&str> = text.split_inclusive('\n').collect();
        self.emit(&all, sink);
    }

    fn emit(&mut self, lines: &[&str], sink: &dyn ProgressSink) {
        for line in lines.iter().skip(self.forwarded) {
            let trimmed = line.trim_end();
            if !trimmed.trim().is_empty() {
                sink.log(trimmed);
            }
        }
        self.forwarded = self.forwarded.max(lines.len());
    }
}
