//! # Shopflow
//!
//! Credential lifecycle and stage orchestration for recurring commerce data
//! collection.
//!
//! Two halves share the crate:
//!
//! - **Credentials**: a [`secrets::SecretStore`] reads the multi-tenant
//!   credential payload from a versioned secret service, falling back to a
//!   blob store. The [`refresh::RefreshEngine`] refreshes every due tenant's
//!   OAuth token concurrently and writes the set back as a single new version.
//! - **Pipeline**: a [`pipeline::PipelineOrchestrator`] runs external stage
//!   programs in order, each under a hard timeout. Fatal failures abort the
//!   run, tolerable ones are recorded, and the [`pipeline::RunReport`] yields
//!   the process exit code.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use shopflow::prelude::*;
//!
//! let runner = Arc::new(ProcessStageRunner::with_pattern(50, DEFAULT_ERROR_MARKER)?);
//! let stages = vec![
//!     Stage::new("collect", CommandSpec::new("collect-orders").arg("{start_date}")),
//!     Stage::new("images", CommandSpec::new("fetch-images")).tolerable(),
//! ];
//!
//! let window = RunWindow::resolve(RunMode::Yesterday, Utc::now(), offset);
//! let run_id = Uuid::new_v4();
//! let report = PipelineOrchestrator::new(runner)
//!     .run_with_id(run_id, &window.apply(&stages, run_id))
//!     .await;
//! std::process::exit(report.exit_code());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod credentials;
pub mod errors;
pub mod events;
pub mod logging;
pub mod notify;
pub mod pipeline;
pub mod refresh;
pub mod secrets;
pub mod testing;
pub mod window;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::ShopflowConfig;
    pub use crate::credentials::{
        CredentialEntry, CredentialRecord, CredentialSet, IncompleteCredential, ValidCredential,
    };
    pub use crate::errors::{BackendError, ExchangeError, Result, ShopflowError};
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::notify::{NoopNotifier, Notification, Notifier, WebhookNotifier};
    pub use crate::pipeline::{
        CommandSpec, Criticality, PipelineOrchestrator, ProcessStageRunner, RunReport, RunState,
        Stage, StageOutcome, StageRunner, StageStatus, DEFAULT_ERROR_MARKER,
    };
    pub use crate::refresh::{
        HttpTokenExchanger, RefreshEngine, RefreshMode, RefreshSummary, RetryPolicy,
        TokenExchanger, TokenGrant,
    };
    pub use crate::secrets::{
        BlobStore, FileBlobStore, FileSecretService, SecretStore, StoreMode, VersionedSecretService,
    };
    pub use crate::window::{RunMode, RunWindow};
}
