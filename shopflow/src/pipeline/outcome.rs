//! Stage outcomes.

use crate::errors::ShopflowError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::time::Duration;

/// How a stage finished.
///
/// Derived only from the process completion signal, never from output text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Exited with code zero.
    Succeeded,
    /// Exited with a non-zero code.
    Failed,
    /// Killed after exceeding its timeout.
    TimedOut,
    /// Could not be started, or was terminated abnormally.
    Crashed,
    /// Never started because an earlier fatal stage failed.
    NotRun,
}

impl StageStatus {
    /// True for [`StageStatus::Succeeded`].
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// True for statuses that count as a failed stage.
    #[must_use]
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut | Self::Crashed)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Crashed => write!(f, "crashed"),
            Self::NotRun => write!(f, "not_run"),
        }
    }
}

/// The last lines of each output stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputTail {
    /// Last stdout lines, oldest first.
    pub stdout: Vec<String>,
    /// Last stderr lines, oldest first.
    pub stderr: Vec<String>,
}

impl OutputTail {
    /// True when both streams were empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }
}

/// Result of running one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutcome {
    /// How the stage finished.
    pub status: StageStatus,
    /// Process exit code, when it exited normally.
    pub exit_code: Option<i32>,
    /// Wall-clock time spent.
    pub duration: Duration,
    /// Captured output tail.
    pub output_tail: OutputTail,
    /// Crash reason or other detail.
    pub error: Option<String>,
}

impl StageOutcome {
    /// A clean exit.
    #[must_use]
    pub fn succeeded(duration: Duration, output_tail: OutputTail) -> Self {
        Self {
            status: StageStatus::Succeeded,
            exit_code: Some(0),
            duration,
            output_tail,
            error: None,
        }
    }

    /// A non-zero exit.
    #[must_use]
    pub fn failed(exit_code: i32, duration: Duration, output_tail: OutputTail) -> Self {
        Self {
            status: StageStatus::Failed,
            exit_code: Some(exit_code),
            duration,
            output_tail,
            error: None,
        }
    }

    /// A stage killed at its timeout.
    #[must_use]
    pub fn timed_out(duration: Duration, output_tail: OutputTail) -> Self {
        Self {
            status: StageStatus::TimedOut,
            exit_code: None,
            duration,
            output_tail,
            error: None,
        }
    }

    /// A stage that could not run to completion.
    #[must_use]
    pub fn crashed(reason: impl Into<String>, duration: Duration, output_tail: OutputTail) -> Self {
        Self {
            status: StageStatus::Crashed,
            exit_code: None,
            duration,
            output_tail,
            error: Some(reason.into()),
        }
    }

    /// A stage skipped after an abort.
    #[must_use]
    pub fn not_run() -> Self {
        Self {
            status: StageStatus::NotRun,
            exit_code: None,
            duration: Duration::ZERO,
            output_tail: OutputTail::default(),
            error: None,
        }
    }

    /// Maps a failed outcome onto the crate error taxonomy.
    #[must_use]
    pub fn to_error(&self, stage: &str, timeout: Duration) -> Option<ShopflowError> {
        match self.status {
            StageStatus::Failed => Some(ShopflowError::StageFailed {
                stage: stage.to_string(),
                exit_code: self.exit_code.unwrap_or(-1),
            }),
            StageStatus::TimedOut => Some(ShopflowError::StageTimedOut {
                stage: stage.to_string(),
                timeout,
            }),
            StageStatus::Crashed => Some(ShopflowError::StageCrashed {
                stage: stage.to_string(),
                reason: self.error.clone().unwrap_or_else(|| "unknown".to_string()),
            }),
            StageStatus::Succeeded | StageStatus::NotRun => None,
        }
    }

    /// JSON view for events and reports.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "status": self.status,
            "exit_code": self.exit_code,
            "duration_secs": self.duration.as_secs_f64(),
            "error": self.error,
            "stdout_tail": self.output_tail.stdout,
            "stderr_tail": self.output_tail.stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(StageStatus::Succeeded.is_success());
        assert!(!StageStatus::NotRun.is_failure());
        assert!(StageStatus::TimedOut.is_failure());
        assert!(StageStatus::Crashed.is_failure());
        assert_eq!(StageStatus::TimedOut.to_string(), "timed_out");
    }

    #[test]
    fn test_to_error_mapping() {
        let timeout = Duration::from_secs(5);

        let err = StageOutcome::timed_out(timeout, OutputTail::default())
            .to_error("collect", timeout)
            .unwrap();
        assert_eq!(err.to_string(), "Stage 'collect' timed out after 5.0s");

        let err = StageOutcome::failed(3, Duration::ZERO, OutputTail::default())
            .to_error("aggregate", timeout)
            .unwrap();
        assert!(matches!(err, ShopflowError::StageFailed { exit_code: 3, .. }));

        assert!(StageOutcome::not_run().to_error("x", timeout).is_none());
    }

    #[test]
    fn test_to_json() {
        let outcome = StageOutcome::crashed("spawn failed", Duration::from_millis(1500), OutputTail::default());
        let value = outcome.to_json();

        assert_eq!(value["status"], "crashed");
        assert_eq!(value["error"], "spawn failed");
        assert_eq!(value["duration_secs"], 1.5);
    }
}
