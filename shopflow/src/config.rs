//! Configuration loading.
//!
//! Settings come from a TOML file, then a handful of `SHOPFLOW_*`
//! environment overrides. Every field has a default, so a missing file
//! yields a usable configuration for the credential commands.

use crate::errors::{Result, ShopflowError};
use crate::logging::{LogFormat, DEFAULT_LOG_FILTER};
use crate::pipeline::{CommandSpec, Criticality, Stage, DEFAULT_ERROR_MARKER, DEFAULT_TAIL_LINES};
use crate::refresh::{
    BackoffStrategy, JitterStrategy, RefreshEngine, RefreshMode, RetryPolicy, TokenExchanger,
    DEFAULT_CONCURRENCY, TENANT_PLACEHOLDER,
};
use crate::secrets::StoreMode;
use chrono::{FixedOffset, Offset, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Config file used when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "shopflow.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShopflowConfig {
    /// `[logging]`
    #[serde(default)]
    pub logging: LoggingConfig,
    /// `[secrets]`
    #[serde(default)]
    pub secrets: SecretsConfig,
    /// `[refresh]`
    #[serde(default)]
    pub refresh: RefreshConfig,
    /// `[pipeline]`
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// `[notify]`
    #[serde(default)]
    pub notify: NotifyConfig,
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: default_log_filter(),
        }
    }
}

/// Where the credential payload lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretsConfig {
    /// Identifier in the versioned secret service.
    #[serde(default = "default_secret_id")]
    pub secret_id: String,
    /// Object path in the blob store.
    #[serde(default = "default_blob_object")]
    pub blob_object: String,
    /// Which backend receives writes.
    #[serde(default)]
    pub mode: StoreMode,
    /// Root directory of the file-backed secret service.
    #[serde(default = "default_secret_root")]
    pub secret_root: PathBuf,
    /// Root directory of the file-backed blob store.
    #[serde(default = "default_blob_root")]
    pub blob_root: PathBuf,
}

fn default_secret_id() -> String {
    "shopflow-credentials".to_string()
}

fn default_blob_object() -> String {
    "credentials/shopflow-credentials.json".to_string()
}

fn default_secret_root() -> PathBuf {
    PathBuf::from(".shopflow/secrets")
}

fn default_blob_root() -> PathBuf {
    PathBuf::from(".shopflow/blobs")
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            secret_id: default_secret_id(),
            blob_object: default_blob_object(),
            mode: StoreMode::default(),
            secret_root: default_secret_root(),
            blob_root: default_blob_root(),
        }
    }
}

/// Token refresh settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshConfig {
    /// Tenants refreshed at the same time.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Exchange attempts per tenant, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Pause after the first failed attempt.
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    /// How the pause grows on later attempts. Constant keeps it fixed.
    #[serde(default)]
    pub backoff: BackoffStrategy,
    /// Random spread applied to each pause.
    #[serde(default)]
    pub jitter: JitterStrategy,
    /// Upper bound on a single pause.
    #[serde(default = "default_max_retry_delay_secs")]
    pub max_retry_delay_secs: u64,
    /// Per-request timeout for the token endpoint.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Tokens expiring within this window are refreshed.
    #[serde(default = "default_expiry_buffer_secs")]
    pub expiry_buffer_secs: u64,
    /// Refresh every complete record regardless of expiry.
    #[serde(default)]
    pub force: bool,
    /// Token endpoint URL containing `{tenant_id}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_secs() -> u64 {
    5
}

fn default_max_retry_delay_secs() -> u64 {
    60
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_expiry_buffer_secs() -> u64 {
    3600
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
            backoff: BackoffStrategy::default(),
            jitter: JitterStrategy::default(),
            max_retry_delay_secs: default_max_retry_delay_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            expiry_buffer_secs: default_expiry_buffer_secs(),
            force: false,
            token_endpoint: None,
        }
    }
}

/// Pipeline settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Business timezone as whole hours east of UTC.
    #[serde(default = "default_utc_offset_hours")]
    pub utc_offset_hours: i32,
    /// Timeout for stages that do not set one.
    #[serde(default = "default_stage_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Regex marking stage output lines as errors.
    #[serde(default = "default_error_marker")]
    pub error_marker: String,
    /// Output lines kept per stream for the report.
    #[serde(default = "default_tail_lines")]
    pub tail_lines: usize,
    /// Stages in execution order.
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

fn default_utc_offset_hours() -> i32 {
    9
}

fn default_stage_timeout_secs() -> u64 {
    3600
}

fn default_error_marker() -> String {
    DEFAULT_ERROR_MARKER.to_string()
}

fn default_tail_lines() -> usize {
    DEFAULT_TAIL_LINES
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            utc_offset_hours: default_utc_offset_hours(),
            default_timeout_secs: default_stage_timeout_secs(),
            error_marker: default_error_marker(),
            tail_lines: default_tail_lines(),
            stages: Vec::new(),
        }
    }
}

/// One `[[pipeline.stages]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Unique stage name.
    pub name: String,
    /// Program to run.
    pub program: String,
    /// Arguments; may contain `{mode}`, `{start_date}`, `{end_date}`, `{run_id}`.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables; values are templated like `args`.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Overrides `pipeline.default_timeout_secs`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// `fatal` (default) or `tolerable`.
    #[serde(default)]
    pub criticality: Criticality,
    /// Pause before the stage starts.
    #[serde(default)]
    pub pre_delay_secs: u64,
}

/// Outbound notification settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Incoming-webhook URL; notifications are disabled when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    /// Request timeout for the webhook.
    #[serde(default = "default_notify_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_notify_timeout_secs() -> u64 {
    10
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: default_notify_timeout_secs(),
        }
    }
}

impl ShopflowConfig {
    /// Loads `path`, applies process environment overrides, and validates.
    ///
    /// A missing file is not an error.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config = Self::from_toml_str(&content)
                .map_err(|e| ShopflowError::config(format!("{}: {e}", path.display())))?;
            info!(path = %path.display(), "Loaded configuration");
            config
        } else {
            debug!(path = %path.display(), "Config file not found, using defaults");
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML document without validating it.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ShopflowError::config(e.to_string()))
    }

    /// Applies `SHOPFLOW_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup("SHOPFLOW_SECRET_ROOT") {
            self.secrets.secret_root = PathBuf::from(root);
        }
        if let Some(root) = lookup("SHOPFLOW_BLOB_ROOT") {
            self.secrets.blob_root = PathBuf::from(root);
        }
        if let Some(mode) = lookup("SHOPFLOW_STORE_MODE") {
            self.secrets.mode = mode.parse()?;
        }
        if let Some(url) = lookup("SHOPFLOW_WEBHOOK_URL") {
            let url = url.trim();
            self.notify.webhook_url = (!url.is_empty()).then(|| url.to_string());
        }
        if let Some(force) = lookup("SHOPFLOW_FORCE_REFRESH") {
            self.refresh.force = parse_flag("SHOPFLOW_FORCE_REFRESH", &force)?;
        }
        Ok(())
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.refresh.concurrency == 0 {
            return Err(ShopflowError::config("refresh.concurrency must be at least 1"));
        }
        if self.refresh.max_attempts == 0 {
            return Err(ShopflowError::config("refresh.max_attempts must be at least 1"));
        }
        if let Some(endpoint) = &self.refresh.token_endpoint {
            if !endpoint.contains(TENANT_PLACEHOLDER) {
                return Err(ShopflowError::config(format!(
                    "refresh.token_endpoint must contain {TENANT_PLACEHOLDER}"
                )));
            }
        }
        if !(-12..=14).contains(&self.pipeline.utc_offset_hours) {
            return Err(ShopflowError::config(format!(
                "pipeline.utc_offset_hours out of range: {}",
                self.pipeline.utc_offset_hours
            )));
        }
        Regex::new(&self.pipeline.error_marker)
            .map_err(|e| ShopflowError::config(format!("pipeline.error_marker: {e}")))?;

        let mut seen = HashSet::new();
        for stage in &self.pipeline.stages {
            if stage.name.trim().is_empty() {
                return Err(ShopflowError::config("stage name cannot be empty"));
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(ShopflowError::config(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
            if stage.timeout_secs == Some(0) {
                return Err(ShopflowError::config(format!(
                    "stage '{}' has a zero timeout",
                    stage.name
                )));
            }
        }
        for stage in self.stages() {
            stage.validate()?;
        }
        Ok(())
    }

    /// Builds the configured stages in order.
    #[must_use]
    pub fn stages(&self) -> Vec<Stage> {
        let default_timeout = Duration::from_secs(self.pipeline.default_timeout_secs);

        self.pipeline
            .stages
            .iter()
            .map(|entry| {
                let mut command = CommandSpec::new(&entry.program).args(entry.args.iter().cloned());
                command.env = entry.env.clone();
                command.working_dir = entry.working_dir.clone();

                Stage::new(&entry.name, command)
                    .with_timeout(entry.timeout_secs.map_or(default_timeout, Duration::from_secs))
                    .with_criticality(entry.criticality)
                    .with_pre_delay(Duration::from_secs(entry.pre_delay_secs))
            })
            .collect()
    }

    /// Retry policy for token exchanges.
    ///
    /// The defaults give a fixed five-second pause. The cap never drops
    /// below the base delay.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        let refresh = &self.refresh;
        let base_ms = refresh.retry_delay_secs.saturating_mul(1000);
        let cap_ms = refresh.max_retry_delay_secs.saturating_mul(1000).max(base_ms);
        RetryPolicy::new()
            .with_max_attempts(refresh.max_attempts)
            .with_base_delay_ms(base_ms)
            .with_max_delay_ms(cap_ms)
            .with_backoff(refresh.backoff)
            .with_jitter(refresh.jitter)
    }

    /// Builds a refresh engine from the `[refresh]` settings.
    ///
    /// Naive `expires_at` values are read in the business timezone.
    pub fn refresh_engine(&self, exchanger: Arc<dyn TokenExchanger>, force_flag: bool) -> RefreshEngine {
        RefreshEngine::new(exchanger)
            .with_retry(self.retry_policy())
            .with_mode(self.refresh_mode(force_flag))
            .with_concurrency(self.refresh.concurrency)
            .with_naive_offset(self.business_offset())
    }

    /// Refresh mode, forced when either the config or `force_flag` asks.
    #[must_use]
    pub fn refresh_mode(&self, force_flag: bool) -> RefreshMode {
        if force_flag || self.refresh.force {
            RefreshMode::Forced
        } else {
            RefreshMode::TimeBased {
                buffer: Duration::from_secs(self.refresh.expiry_buffer_secs),
            }
        }
    }

    /// The business timezone.
    #[must_use]
    pub fn business_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.pipeline.utc_offset_hours * 3600).unwrap_or_else(|| Utc.fix())
    }

    /// Token endpoint request timeout.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh.request_timeout_secs)
    }

    /// Webhook request timeout.
    #[must_use]
    pub fn notify_timeout(&self) -> Duration {
        Duration::from_secs(self.notify.timeout_secs)
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(ShopflowError::config(format!("{key}: expected a boolean, got '{other}'"))),
    }
}
