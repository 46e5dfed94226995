//! Stage execution and pipeline orchestration.
//!
//! A [`StageRunner`] executes one [`Stage`] under a hard timeout and reports
//! a [`StageOutcome`]. The [`PipelineOrchestrator`] runs stages in order,
//! applies each stage's [`Criticality`], and returns a [`RunReport`] whose
//! exit code is the run's pass/fail signal.

pub mod orchestrator;
pub mod outcome;
pub mod report;
pub mod runner;
pub mod stage;


pub use orchestrator::{OrchestratorState, PipelineOrchestrator};
pub use outcome::{OutputTail, StageOutcome, StageStatus};
pub use report::{RunReport, RunState, StageReport};
pub use runner::{
    LineTail, ProcessStageRunner, StageRunner, DEFAULT_DRAIN_GRACE, DEFAULT_ERROR_MARKER,
    DEFAULT_TAIL_LINES,
};
pub use stage::{CommandSpec, Criticality, Stage, DEFAULT_STAGE_TIMEOUT};
