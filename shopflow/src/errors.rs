//! Error types for shopflow.
//!
//! The top-level [`ShopflowError`] carries the operational taxonomy
//! (credential availability, tenant refresh, stage execution) plus the
//! ambient configuration and I/O failures. Secret backends and the token
//! endpoint have their own narrower error types so callers can decide on
//! fallback and retry without string matching.

use std::time::Duration;
use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, ShopflowError>;

/// The main error type for shopflow operations.
#[derive(Debug, Error)]
pub enum ShopflowError {
    /// Both secret backends failed to produce a payload.
    #[error("Credentials unavailable: primary backend failed ({primary}); fallback backend failed ({fallback})")]
    CredentialUnavailable {
        /// Error reported by the versioned secret service.
        primary: String,
        /// Error reported by the blob store.
        fallback: String,
    },

    /// A tenant's token refresh exhausted its attempts or hit a terminal error.
    #[error("Refresh failed for tenant '{tenant_id}' after {attempts} attempt(s): {reason}")]
    RefreshFailed {
        /// The tenant whose refresh failed.
        tenant_id: String,
        /// How many exchange attempts were made.
        attempts: u32,
        /// The last error observed.
        reason: String,
    },

    /// A stage exceeded its wall-clock timeout.
    #[error("Stage '{stage}' timed out after {:.1}s", timeout.as_secs_f64())]
    StageTimedOut {
        /// The stage name.
        stage: String,
        /// The timeout that was enforced.
        timeout: Duration,
    },

    /// A stage completed with a non-zero exit code.
    #[error("Stage '{stage}' failed with exit code {exit_code}")]
    StageFailed {
        /// The stage name.
        stage: String,
        /// The process exit code.
        exit_code: i32,
    },

    /// A stage could not be invoked or was terminated abnormally.
    #[error("Stage '{stage}' crashed: {reason}")]
    StageCrashed {
        /// The stage name.
        stage: String,
        /// What went wrong.
        reason: String,
    },

    /// A secret backend write or read failed outside the fallback path.
    #[error("Secret backend error: {0}")]
    Backend(#[from] BackendError),

    /// Invalid or unreadable configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShopflowError {
    /// Creates a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

/// Errors raised by a single secret backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The secret or object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller is not allowed to access the secret or object.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A temporary failure (network, throttling, unavailable service).
    #[error("transient failure: {0}")]
    Transient(String),

    /// The reference itself is unusable (bad id, path traversal).
    #[error("invalid reference: {0}")]
    Invalid(String),

    /// Local storage failure.
    #[error("io failure: {0}")]
    Io(String),
}

impl BackendError {
    /// Returns true if the error means the secret does not exist yet.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}

/// Errors raised by an OAuth refresh-token exchange.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExchangeError {
    /// The request never produced an HTTP response.
    #[error("transport error: {0}")]
    Transport(String),

    /// The token endpoint answered with a non-success status.
    #[error("token endpoint returned HTTP {status}: {body}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Truncated response body.
        body: String,
    },

    /// The endpoint answered 2xx but the body is not a usable token grant.
    #[error("malformed token response: {0}")]
    MalformedResponse(String),
}

impl ExchangeError {
    /// Only network and HTTP failures are worth another attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Http { .. })
    }
}
