//! Run reports.

use super::outcome::{StageOutcome, StageStatus};
use super::stage::Criticality;
use crate::errors::ShopflowError;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::fmt::Write as _;
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

/// One row of the run report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    /// Stage name.
    pub name: String,
    /// Stage failure policy.
    pub criticality: Criticality,
    /// Timeout the stage ran under.
    pub timeout: Duration,
    /// How the stage finished.
    pub outcome: StageOutcome,
}

impl StageReport {
    /// The stage failure as a crate error, if it failed.
    #[must_use]
    pub fn to_error(&self) -> Option<ShopflowError> {
        self.outcome.to_error(&self.name, self.timeout)
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    /// Every stage was attempted.
    Completed,
    /// A fatal stage failed and the rest were not run.
    Aborted {
        /// The stage that caused the abort.
        stage: String,
    },
}

/// The outcome of an orchestrated run, in stage order.
///
/// This is the only artifact a caller needs to decide the exit status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Run identifier.
    pub run_id: Uuid,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// One row per input stage, including stages that never ran.
    pub stages: Vec<StageReport>,
    /// Total wall-clock time.
    pub elapsed: Duration,
    /// How the run ended.
    pub final_state: RunState,
}

impl RunReport {
    /// Creates an empty report for a run starting now.
    #[must_use]
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            stages: Vec::new(),
            elapsed: Duration::ZERO,
            final_state: RunState::Completed,
        }
    }

    /// Appends a stage row.
    pub fn push(&mut self, stage: StageReport) {
        self.stages.push(stage);
    }

    /// Stages that succeeded.
    #[must_use]
    pub fn success_count(&self) -> usize {
        self.count(StageStatus::is_success)
    }

    /// Stages that failed, timed out or crashed.
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.count(StageStatus::is_failure)
    }

    /// All stages in the run, executed or not.
    #[must_use]
    pub fn total_count(&self) -> usize {
        self.stages.len()
    }

    /// Stages that were actually started.
    #[must_use]
    pub fn executed(&self) -> impl Iterator<Item = &StageReport> {
        self.stages.iter().filter(|s| s.outcome.status != StageStatus::NotRun)
    }

    /// Stages that never started.
    #[must_use]
    pub fn not_run(&self) -> impl Iterator<Item = &StageReport> {
        self.stages.iter().filter(|s| s.outcome.status == StageStatus::NotRun)
    }

    /// True when no stage failed, tolerable ones included.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failure_count() == 0
    }

    /// Process exit code: 0 when every stage succeeded, 1 otherwise.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        i32::from(!self.is_success())
    }

    /// Errors for every failed stage.
    #[must_use]
    pub fn errors(&self) -> Vec<ShopflowError> {
        self.stages.iter().filter_map(StageReport::to_error).collect()
    }

    fn count(&self, predicate: impl Fn(StageStatus) -> bool) -> usize {
        self.stages.iter().filter(|s| predicate(s.outcome.status)).count()
    }

    /// Per-stage status table.
    #[must_use]
    pub fn render_table(&self) -> String {
        let width = self
            .stages
            .iter()
            .map(|s| s.name.len())
            .max()
            .unwrap_or(0)
            .max("STAGE".len());

        let mut table = format!(
            "{:<width$}  {:<11}  {:<10}  {:>9}  {:>4}\n",
            "STAGE", "CRITICALITY", "STATUS", "DURATION", "EXIT"
        );
        for stage in &self.stages {
            let exit = stage
                .outcome
                .exit_code
                .map_or_else(|| "-".to_string(), |code| code.to_string());
            let _ = writeln!(
                table,
                "{:<width$}  {:<11}  {:<10}  {:>8.1}s  {:>4}",
                stage.name,
                stage.criticality.to_string(),
                stage.outcome.status.to_string(),
                stage.outcome.duration.as_secs_f64(),
                exit
            );
        }
        let _ = write!(
            table,
            "{}/{} stages succeeded in {:.1}s",
            self.success_count(),
            self.total_count(),
            self.elapsed.as_secs_f64()
        );
        table
    }

    /// Logs one line per stage and the aggregate count.
    pub fn log_summary(&self) {
        for stage in &self.stages {
            if stage.outcome.status.is_failure() {
                error!(
                    run_id = %self.run_id,
                    stage = %stage.name,
                    status = %stage.outcome.status,
                    exit_code = ?stage.outcome.exit_code,
                    duration_secs = stage.outcome.duration.as_secs_f64(),
                    stderr_tail = ?stage.outcome.output_tail.stderr,
                    "Stage result"
                );
            } else {
                info!(
                    run_id = %self.run_id,
                    stage = %stage.name,
                    status = %stage.outcome.status,
                    duration_secs = stage.outcome.duration.as_secs_f64(),
                    "Stage result"
                );
            }
        }

        info!(
            run_id = %self.run_id,
            success = self.success_count(),
            total = self.total_count(),
            elapsed_secs = self.elapsed.as_secs_f64(),
            "Pipeline finished: {}/{} stages succeeded",
            self.success_count(),
            self.total_count()
        );
    }

    /// JSON view of the report.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let (state, aborted_at) = match &self.final_state {
            RunState::Completed => ("completed", None),
            RunState::Aborted { stage } => ("aborted", Some(stage.as_str())),
        };

        json!({
            "run_id": self.run_id.to_string(),
            "started_at": self.started_at.to_rfc3339(),
            "elapsed_secs": self.elapsed.as_secs_f64(),
            "state": state,
            "aborted_at": aborted_at,
            "success_count": self.success_count(),
            "total_count": self.total_count(),
            "exit_code": self.exit_code(),
            "stages": self.stages.iter().map(|s| {
                let mut value = s.outcome.to_json();
                value["name"] = json!(s.name);
                value["criticality"] = json!(s.criticality);
                value
            }).collect::<Vec<_>>(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::outcome::OutputTail;

    fn row(name: &str, criticality: Criticality, outcome: StageOutcome) -> StageReport {
        StageReport {
            name: name.to_string(),
            criticality,
            timeout: Duration::from_secs(60),
            outcome,
        }
    }

    fn sample() -> RunReport {
        let mut report = RunReport::new(Uuid::new_v4());
        report.push(row(
            "collect",
            Criticality::Fatal,
            StageOutcome::succeeded(Duration::from_secs(3), OutputTail::default()),
        ));
        report.push(row(
            "images",
            Criticality::Tolerable,
            StageOutcome::failed(2, Duration::from_secs(1), OutputTail::default()),
        ));
        report.push(row(
            "aggregate",
            Criticality::Fatal,
            StageOutcome::succeeded(Duration::from_secs(5), OutputTail::default()),
        ));
        report
    }

    #[test]
    fn test_tolerable_failure_flips_exit_code() {
        let report = sample();
        assert_eq!(report.success_count(), 2);
        assert_eq!(report.total_count(), 3);
        assert!(!report.is_success());
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.errors().len(), 1);
    }

    #[test]
    fn test_clean_run_exit_zero() {
        let mut report = RunReport::new(Uuid::new_v4());
        report.push(row(
            "collect",
            Criticality::Fatal,
            StageOutcome::succeeded(Duration::ZERO, OutputTail::default()),
        ));
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn test_not_run_is_not_executed() {
        let mut report = sample();
        report.push(row("publish", Criticality::Fatal, StageOutcome::not_run()));

        assert_eq!(report.executed().count(), 3);
        assert_eq!(report.not_run().count(), 1);
        assert_eq!(report.total_count(), 4);
    }

    #[test]
    fn test_render_table() {
        let table = sample().render_table();
        assert!(table.starts_with("STAGE"));
        assert!(table.contains("images"));
        assert!(table.contains("tolerable"));
        assert!(table.ends_with(&format!("2/3 stages succeeded in {:.1}s", 0.0)));
    }

    #[test]
    fn test_to_json() {
        let mut report = sample();
        report.final_state = RunState::Aborted {
            stage: "images".to_string(),
        };
        let value = report.to_json();

        assert_eq!(value["state"], "aborted");
        assert_eq!(value["aborted_at"], "images");
        assert_eq!(value["stages"][1]["status"], "failed");
        assert_eq!(value["stages"][1]["criticality"], "tolerable");
    }
}
