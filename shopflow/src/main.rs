//! `shopflow` command-line entry point.

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use shopflow::config::{ShopflowConfig, DEFAULT_CONFIG_PATH};
use shopflow::credentials::{CredentialEntry, CredentialSet};
use shopflow::events::LoggingEventSink;
use shopflow::logging::{self, LogFormat};
use shopflow::notify::{NoopNotifier, Notifier, WebhookNotifier};
use shopflow::pipeline::{PipelineOrchestrator, ProcessStageRunner};
use shopflow::refresh::HttpTokenExchanger;
use shopflow::secrets::{FileBlobStore, FileSecretService, SecretStore};
use shopflow::window::{RunMode, RunWindow};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Exit status for usage errors.
const EXIT_USAGE: u8 = 2;

#[derive(Parser)]
#[command(name = "shopflow")]
#[command(about = "Credential refresh and stage orchestration for commerce data collection")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the TOML configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log output format, overriding the config file
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured stages for a date window
    Run {
        /// today, yesterday, or last_7_days
        mode: String,
    },

    /// Refresh OAuth tokens for every due tenant
    Refresh {
        /// Refresh every complete record regardless of expiry
        #[arg(long)]
        force: bool,
    },

    /// Show each tenant's refreshability and token expiry
    Credentials,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match ShopflowConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("shopflow: {e}");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    logging::init(
        cli.log_format.unwrap_or(config.logging.format),
        &config.logging.filter,
    );

    let result = match cli.command {
        Commands::Run { mode } => run_pipeline(&config, &mode).await,
        Commands::Refresh { force } => refresh(&config, force).await,
        Commands::Credentials => show_credentials(&config).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = format!("{e:#}"), "Command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run_pipeline(config: &ShopflowConfig, mode: &str) -> anyhow::Result<ExitCode> {
    let mode: RunMode = match mode.parse() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("shopflow: {e}");
            return Ok(ExitCode::from(EXIT_USAGE));
        }
    };

    let window = RunWindow::resolve(mode, Utc::now(), config.business_offset());
    let run_id = Uuid::new_v4();
    let stages = window.apply(&config.stages(), run_id);
    info!(window = %window, run_id = %run_id, stages = stages.len(), "Starting pipeline run");

    let runner = ProcessStageRunner::with_pattern(config.pipeline.tail_lines, &config.pipeline.error_marker)?;
    let report = PipelineOrchestrator::new(Arc::new(runner))
        .with_event_sink(Arc::new(LoggingEventSink::info()))
        .with_notifier(build_notifier(config)?)
        .run_with_id(run_id, &stages)
        .await;

    Ok(exit_code(report.exit_code()))
}

async fn refresh(config: &ShopflowConfig, force: bool) -> anyhow::Result<ExitCode> {
    let endpoint = config
        .refresh
        .token_endpoint
        .as_deref()
        .context("refresh.token_endpoint is not configured")?;

    let store = build_store(config);
    let exchanger = HttpTokenExchanger::new(endpoint, config.request_timeout())?;
    let engine = config
        .refresh_engine(Arc::new(exchanger), force)
        .with_notifier(build_notifier(config)?)
        .with_event_sink(Arc::new(LoggingEventSink::info()));

    let run = engine.run(&store).await.context("credential refresh aborted")?;
    info!(version = %run.version, "Credential set written");

    Ok(if run.summary.has_failures() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn show_credentials(config: &ShopflowConfig) -> anyhow::Result<ExitCode> {
    let store = build_store(config);
    let loaded = store.load_latest().await.context("cannot load credentials")?;
    let set = CredentialSet::from_bytes(&loaded.payload)?;

    let mode = config.refresh_mode(false);
    let offset = config.business_offset();
    let now = Utc::now();

    println!("source: {} version {}", loaded.store_backend, loaded.version);
    println!("{:<24} {:<12} {:<28} {}", "TENANT", "STATUS", "EXPIRES_AT", "DUE");
    for entry in set.into_entries() {
        let record = entry.record();
        let expires = record
            .expires_at_utc(offset)
            .map_or_else(|| "-".to_string(), |at| at.to_rfc3339());
        let (status, due) = match &entry {
            CredentialEntry::Valid(_) => ("ok".to_string(), mode.is_due(record, now, offset).to_string()),
            CredentialEntry::Incomplete(incomplete) => (
                "incomplete".to_string(),
                format!("missing {}", incomplete.missing.join(",")),
            ),
        };
        println!("{:<24} {:<12} {:<28} {}", record.tenant_label(), status, expires, due);
    }

    Ok(ExitCode::SUCCESS)
}

fn build_store(config: &ShopflowConfig) -> SecretStore {
    let secrets = &config.secrets;
    SecretStore::new(
        Arc::new(FileSecretService::new(&secrets.secret_root)),
        Arc::new(FileBlobStore::new(&secrets.blob_root)),
        &secrets.secret_id,
        &secrets.blob_object,
    )
    .with_mode(secrets.mode)
}

fn build_notifier(config: &ShopflowConfig) -> anyhow::Result<Arc<dyn Notifier>> {
    let notifier: Arc<dyn Notifier> = match &config.notify.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url, config.notify_timeout())?),
        None => Arc::new(NoopNotifier),
    };
    Ok(notifier)
}

fn exit_code(code: i32) -> ExitCode {
    u8::try_from(code).map_or(ExitCode::FAILURE, ExitCode::from)
}
