//! Testing utilities for shopflow pipelines and refresh runs.

mod mocks;

pub use mocks::{RecordingNotifier, ScriptedRunner};
