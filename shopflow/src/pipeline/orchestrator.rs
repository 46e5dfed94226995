//! Sequential stage orchestration.
//!
//! Stages run strictly in input order. A failed `fatal` stage aborts the
//! run and every later stage is reported as not run; a failed `tolerable`
//! stage is recorded and the run continues. Either kind of failure makes
//! the run's exit code non-zero.

use super::outcome::{OutputTail, StageOutcome};
use super::report::{RunReport, RunState, StageReport};
use super::runner::StageRunner;
use super::stage::{Criticality, Stage};
use crate::events::{EventSink, NoOpEventSink};
use crate::notify::{NoopNotifier, Notification, Notifier};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Orchestrator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Nothing has run yet.
    Init,
    /// A stage is executing.
    Running,
    /// The last stage succeeded.
    StageSucceeded,
    /// The last stage failed.
    StageFailed,
    /// Every stage was attempted.
    Completed,
    /// A fatal stage failed.
    Aborted,
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::Running => write!(f, "running"),
            Self::StageSucceeded => write!(f, "stage_succeeded"),
            Self::StageFailed => write!(f, "stage_failed"),
            Self::Completed => write!(f, "completed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Runs an ordered list of stages and produces a [`RunReport`].
#[derive(Clone)]
pub struct PipelineOrchestrator {
    runner: Arc<dyn StageRunner>,
    events: Arc<dyn EventSink>,
    notifier: Arc<dyn Notifier>,
}

impl fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineOrchestrator").finish_non_exhaustive()
    }
}

impl PipelineOrchestrator {
    /// Creates an orchestrator around a stage runner.
    pub fn new(runner: Arc<dyn StageRunner>) -> Self {
        Self {
            runner,
            events: Arc::new(NoOpEventSink),
            notifier: Arc::new(NoopNotifier),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sets the notifier used when a run fails.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Runs `stages` under a fresh run id.
    pub async fn run(&self, stages: &[Stage]) -> RunReport {
        self.run_with_id(Uuid::new_v4(), stages).await
    }

    /// Runs `stages` under `run_id`.
    pub async fn run_with_id(&self, run_id: Uuid, stages: &[Stage]) -> RunReport {
        let started = Instant::now();
        let mut report = RunReport::new(run_id);
        let mut state = OrchestratorState::Init;

        info!(run_id = %run_id, stages = stages.len(), "Pipeline started");
        self.events.try_emit(
            "pipeline.started",
            Some(json!({
                "run_id": run_id.to_string(),
                "stages": stages.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            })),
        );

        for stage in stages {
            if state == OrchestratorState::Aborted {
                debug!(run_id = %run_id, stage = %stage.name, "Skipping stage after abort");
                report.push(Self::row(stage, StageOutcome::not_run()));
                continue;
            }

            if !stage.pre_delay.is_zero() {
                info!(
                    stage = %stage.name,
                    delay_secs = stage.pre_delay.as_secs_f64(),
                    "Waiting before stage"
                );
                tokio::time::sleep(stage.pre_delay).await;
            }

            state = transition(run_id, state, OrchestratorState::Running);
            self.events.try_emit(
                "stage.started",
                Some(json!({"run_id": run_id.to_string(), "stage": stage.name})),
            );

            let outcome = self.execute(stage).await;
            let data = {
                let mut data = outcome.to_json();
                data["run_id"] = json!(run_id.to_string());
                data["stage"] = json!(stage.name);
                data
            };

            if outcome.status.is_success() {
                state = transition(run_id, state, OrchestratorState::StageSucceeded);
                self.events.try_emit("stage.completed", Some(data));
            } else {
                state = transition(run_id, state, OrchestratorState::StageFailed);
                self.events.try_emit("stage.failed", Some(data));

                match stage.criticality {
                    Criticality::Fatal => {
                        error!(
                            run_id = %run_id,
                            stage = %stage.name,
                            status = %outcome.status,
                            "Fatal stage failed, aborting pipeline"
                        );
                        self.events.try_emit(
                            "pipeline.aborted",
                            Some(json!({"run_id": run_id.to_string(), "stage": stage.name})),
                        );
                        report.final_state = RunState::Aborted {
                            stage: stage.name.clone(),
                        };
                        state = transition(run_id, state, OrchestratorState::Aborted);
                    }
                    Criticality::Tolerable => {
                        warn!(
                            run_id = %run_id,
                            stage = %stage.name,
                            status = %outcome.status,
                            "Tolerable stage failed, continuing"
                        );
                    }
                }
            }

            report.push(Self::row(stage, outcome));
        }

        if state != OrchestratorState::Aborted {
            transition(run_id, state, OrchestratorState::Completed);
        }
        report.elapsed = started.elapsed();

        self.events.try_emit(
            "pipeline.completed",
            Some(json!({
                "run_id": run_id.to_string(),
                "success_count": report.success_count(),
                "total_count": report.total_count(),
                "exit_code": report.exit_code(),
            })),
        );
        report.log_summary();

        if !report.is_success() {
            let notification = Notification::new(format!(
                "Pipeline run {run_id} failed: {}/{} stages succeeded",
                report.success_count(),
                report.total_count()
            ))
            .with_section(format!("```\n{}\n```", report.render_table()));
            self.notifier.notify(&notification).await;
        }

        report
    }

    async fn execute(&self, stage: &Stage) -> StageOutcome {
        let runner = Arc::clone(&self.runner);
        let owned = stage.clone();
        let started = Instant::now();

        match tokio::spawn(async move { runner.run(&owned).await }).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(stage = %stage.name, error = %e, "Stage runner panicked");
                StageOutcome::crashed(
                    format!("stage runner panicked: {e}"),
                    started.elapsed(),
                    OutputTail::default(),
                )
            }
        }
    }

    fn row(stage: &Stage, outcome: StageOutcome) -> StageReport {
        StageReport {
            name: stage.name.clone(),
            criticality: stage.criticality,
            timeout: stage.timeout,
            outcome,
        }
    }
}

fn transition(run_id: Uuid, from: OrchestratorState, to: OrchestratorState) -> OrchestratorState {
    debug!(run_id = %run_id, from = %from, to = %to, "Orchestrator state change");
    to
}
