//! Test doubles for runners and notifiers.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::notify::{Notification, Notifier};
use crate::pipeline::{OutputTail, Stage, StageOutcome, StageRunner, StageStatus};

/// A stage runner that returns scripted outcomes and records calls.
///
/// Stages without a script succeed.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    statuses: HashMap<String, StageStatus>,
    panics: HashSet<String>,
    delays: HashMap<String, Duration>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    /// Creates a runner where every stage succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the status returned for `stage`.
    #[must_use]
    pub fn with_status(mut self, stage: impl Into<String>, status: StageStatus) -> Self {
        self.statuses.insert(stage.into(), status);
        self
    }

    /// Makes the runner panic when asked to run `stage`.
    #[must_use]
    pub fn panicking_on(mut self, stage: impl Into<String>) -> Self {
        self.panics.insert(stage.into());
        self
    }

    /// Makes `stage` take `delay` before returning.
    #[must_use]
    pub fn with_delay(mut self, stage: impl Into<String>, delay: Duration) -> Self {
        self.delays.insert(stage.into(), delay);
        self
    }

    /// Names of the stages run, in call order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Number of times `stage` was run.
    #[must_use]
    pub fn call_count(&self, stage: &str) -> usize {
        self.calls.lock().iter().filter(|c| *c == stage).count()
    }
}

#[async_trait]
impl StageRunner for ScriptedRunner {
    async fn run(&self, stage: &Stage) -> StageOutcome {
        self.calls.lock().push(stage.name.clone());

        if let Some(delay) = self.delays.get(&stage.name) {
            tokio::time::sleep(*delay).await;
        }
        assert!(!self.panics.contains(&stage.name), "scripted panic in stage '{}'", stage.name);

        let duration = self.delays.get(&stage.name).copied().unwrap_or_default();
        match self.statuses.get(&stage.name).copied().unwrap_or(StageStatus::Succeeded) {
            StageStatus::Succeeded => StageOutcome::succeeded(duration, OutputTail::default()),
            StageStatus::Failed => StageOutcome::failed(1, duration, OutputTail::default()),
            StageStatus::TimedOut => StageOutcome::timed_out(duration, OutputTail::default()),
            StageStatus::Crashed => StageOutcome::crashed("scripted crash", duration, OutputTail::default()),
            StageStatus::NotRun => StageOutcome::not_run(),
        }
    }
}

/// A notifier that keeps every notification it receives.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications received, in order.
    #[must_use]
    pub fn notifications(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }

    /// Number of notifications received.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sent.lock().len()
    }

    /// True when nothing was received.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sent.lock().is_empty()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) {
        self.sent.lock().push(notification.clone());
    }
}
