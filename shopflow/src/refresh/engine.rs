//! Concurrent per-tenant token refresh with a single write-back.

use super::exchange::TokenExchanger;
use super::retry::RetryPolicy;
use crate::credentials::{fingerprint, CredentialEntry, CredentialRecord, CredentialSet};
use crate::errors::{ExchangeError, Result, ShopflowError};
use crate::events::{EventSink, NoOpEventSink};
use crate::notify::{NoopNotifier, Notification, Notifier};
use crate::secrets::{SecretStore, VersionId};
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, Offset, Utc};
use futures::{FutureExt, StreamExt};
use serde_json::json;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default number of tenants refreshed in parallel.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Default window before expiry in which a token counts as due.
pub const DEFAULT_EXPIRY_BUFFER: Duration = Duration::from_secs(3600);

/// Decides which records are due for refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    /// Every valid record is due regardless of expiry.
    ///
    /// Rotating providers issue a new refresh token on every exchange, so a
    /// forced run churns every tenant's token.
    Forced,
    /// A record is due when its access token expires within `buffer`, or
    /// when its expiry is missing or unreadable.
    TimeBased {
        /// Window before expiry.
        buffer: Duration,
    },
}

impl Default for RefreshMode {
    fn default() -> Self {
        Self::TimeBased {
            buffer: DEFAULT_EXPIRY_BUFFER,
        }
    }
}

impl fmt::Display for RefreshMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forced => write!(f, "forced"),
            Self::TimeBased { buffer } => write!(f, "time_based({}s)", buffer.as_secs()),
        }
    }
}

impl RefreshMode {
    /// True if `record` should be refreshed at `now`.
    #[must_use]
    pub fn is_due(&self, record: &CredentialRecord, now: DateTime<Utc>, naive_offset: FixedOffset) -> bool {
        match self {
            Self::Forced => true,
            Self::TimeBased { buffer } => {
                let Some(expires_at) = record.expires_at_utc(naive_offset) else {
                    return true;
                };
                let buffer = ChronoDuration::from_std(*buffer).unwrap_or_else(|_| ChronoDuration::weeks(5200));
                expires_at <= now + buffer
            }
        }
    }
}

/// What happened to one tenant during a refresh run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantRefreshStatus {
    /// The exchange succeeded and the record was updated.
    Refreshed {
        /// Whether the provider rotated the refresh token.
        rotated: bool,
    },
    /// The record is valid but its token is not yet near expiry.
    NotDue,
    /// Required fields are missing; the record was left untouched.
    Skipped {
        /// The missing fields.
        missing: Vec<&'static str>,
    },
    /// The exchange failed; the record was left untouched.
    Failed {
        /// Attempts made.
        attempts: u32,
        /// The last error.
        reason: String,
    },
}

impl fmt::Display for TenantRefreshStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Refreshed { rotated: true } => write!(f, "refreshed"),
            Self::Refreshed { rotated: false } => write!(f, "refreshed (refresh token not rotated)"),
            Self::NotDue => write!(f, "not due"),
            Self::Skipped { missing } => write!(f, "skipped (missing: {})", missing.join(", ")),
            Self::Failed { attempts, reason } => {
                write!(f, "failed after {attempts} attempt(s): {reason}")
            }
        }
    }
}

/// Per-tenant result of a refresh run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantRefreshResult {
    /// Tenant id, or a placeholder when the record has none.
    pub tenant_id: String,
    /// What happened.
    pub status: TenantRefreshStatus,
}

impl TenantRefreshResult {
    /// The failure as a crate error, if the tenant failed.
    #[must_use]
    pub fn to_error(&self) -> Option<ShopflowError> {
        match &self.status {
            TenantRefreshStatus::Failed { attempts, reason } => Some(ShopflowError::RefreshFailed {
                tenant_id: self.tenant_id.clone(),
                attempts: *attempts,
                reason: reason.clone(),
            }),
            _ => None,
        }
    }
}

/// Aggregate of a refresh run, in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    /// One result per record.
    pub results: Vec<TenantRefreshResult>,
}

impl RefreshSummary {
    /// Tenants refreshed successfully.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.count(|s| matches!(s, TenantRefreshStatus::Refreshed { .. }))
    }

    /// Tenants whose exchange failed.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, TenantRefreshStatus::Failed { .. }))
    }

    /// Records skipped for missing fields.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, TenantRefreshStatus::Skipped { .. }))
    }

    /// Records not yet due.
    #[must_use]
    pub fn not_due(&self) -> usize {
        self.count(|s| matches!(s, TenantRefreshStatus::NotDue))
    }

    /// True when at least one tenant failed.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.failed() > 0
    }

    /// Errors for every failed tenant.
    #[must_use]
    pub fn failures(&self) -> Vec<ShopflowError> {
        self.results.iter().filter_map(TenantRefreshResult::to_error).collect()
    }

    /// Looks up one tenant's status.
    #[must_use]
    pub fn status_of(&self, tenant_id: &str) -> Option<&TenantRefreshStatus> {
        self.results
            .iter()
            .rev()
            .find(|r| r.tenant_id == tenant_id)
            .map(|r| &r.status)
    }

    fn count(&self, predicate: impl Fn(&TenantRefreshStatus) -> bool) -> usize {
        self.results.iter().filter(|r| predicate(&r.status)).count()
    }
}

impl fmt::Display for RefreshSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed, {} skipped, {} not due",
            self.succeeded(),
            self.failed(),
            self.skipped(),
            self.not_due()
        )
    }
}

/// Result of [`RefreshEngine::run`].
#[derive(Debug, Clone)]
pub struct RefreshRun {
    /// Per-tenant results.
    pub summary: RefreshSummary,
    /// The version written back.
    pub version: VersionId,
}

/// Refreshes every due credential in a set.
///
/// Each tenant is handled by its own worker, up to `concurrency` at a time.
/// A worker owns exactly one record, so no record is shared between
/// workers. Nothing is persisted until every worker has finished.
#[derive(Clone)]
pub struct RefreshEngine {
    exchanger: Arc<dyn TokenExchanger>,
    retry: RetryPolicy,
    mode: RefreshMode,
    concurrency: usize,
    naive_offset: FixedOffset,
    notifier: Arc<dyn Notifier>,
    events: Arc<dyn EventSink>,
}

impl fmt::Debug for RefreshEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshEngine")
            .field("retry", &self.retry)
            .field("mode", &self.mode)
            .field("concurrency", &self.concurrency)
            .field("naive_offset", &self.naive_offset)
            .finish_non_exhaustive()
    }
}

impl RefreshEngine {
    /// Creates an engine with default policy around `exchanger`.
    pub fn new(exchanger: Arc<dyn TokenExchanger>) -> Self {
        Self {
            exchanger,
            retry: RetryPolicy::default(),
            mode: RefreshMode::default(),
            concurrency: DEFAULT_CONCURRENCY,
            naive_offset: Utc.fix(),
            notifier: Arc::new(NoopNotifier),
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the eligibility mode.
    #[must_use]
    pub fn with_mode(mut self, mode: RefreshMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the worker bound. Zero is treated as one.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Sets the offset used for `expires_at` values without one.
    #[must_use]
    pub fn with_naive_offset(mut self, offset: FixedOffset) -> Self {
        self.naive_offset = offset;
        self
    }

    /// Sets the notifier used for unrecoverable tenant failures.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Returns the eligibility mode.
    #[must_use]
    pub fn mode(&self) -> RefreshMode {
        self.mode
    }

    /// Returns the offset used for `expires_at` values without one.
    #[must_use]
    pub fn naive_offset(&self) -> FixedOffset {
        self.naive_offset
    }

    /// Refreshes every due record and returns the full updated set.
    ///
    /// Incomplete, not-due and failed records come back exactly as they
    /// went in. The output set keeps the input order and payload style.
    pub async fn refresh_all(&self, set: CredentialSet) -> (CredentialSet, RefreshSummary) {
        self.refresh_all_with(set, self.concurrency).await
    }

    /// Like [`RefreshEngine::refresh_all`], with an explicit worker bound
    /// for this call. Zero is treated as one.
    pub async fn refresh_all_with(&self, set: CredentialSet, concurrency: usize) -> (CredentialSet, RefreshSummary) {
        let now = Utc::now();
        let style = set.style();

        let mut finished: Vec<(usize, CredentialEntry, TenantRefreshResult)> =
            futures::stream::iter(set.into_entries().into_iter().enumerate())
                .map(|(index, entry)| {
                    let original = entry.clone();
                    async move {
                        let worker = AssertUnwindSafe(self.refresh_entry(entry, now)).catch_unwind();
                        match worker.await {
                            Ok((entry, result)) => (index, entry, result),
                            Err(_) => {
                                let tenant_id = original.record().tenant_label().to_string();
                                error!(tenant_id = %tenant_id, "Refresh worker panicked");
                                let result = TenantRefreshResult {
                                    tenant_id,
                                    status: TenantRefreshStatus::Failed {
                                        attempts: 0,
                                        reason: "refresh worker panicked".to_string(),
                                    },
                                };
                                (index, original, result)
                            }
                        }
                    }
                })
                .buffer_unordered(concurrency.max(1))
                .collect()
                .await;

        finished.sort_by_key(|(index, _, _)| *index);

        let mut entries = Vec::with_capacity(finished.len());
        let mut results = Vec::with_capacity(finished.len());
        for (_, entry, result) in finished {
            entries.push(entry);
            results.push(result);
        }

        let summary = RefreshSummary { results };
        self.report(&summary).await;

        (CredentialSet::from_entries(entries).with_style(style), summary)
    }

    async fn refresh_entry(&self, entry: CredentialEntry, now: DateTime<Utc>) -> (CredentialEntry, TenantRefreshResult) {
        let mut valid = match entry {
            CredentialEntry::Incomplete(incomplete) => {
                let tenant_id = incomplete.record.tenant_label().to_string();
                warn!(
                    tenant_id = %tenant_id,
                    missing = ?incomplete.missing,
                    "Skipping credential with missing fields"
                );
                let status = TenantRefreshStatus::Skipped {
                    missing: incomplete.missing.clone(),
                };
                return (
                    CredentialEntry::Incomplete(incomplete),
                    TenantRefreshResult { tenant_id, status },
                );
            }
            CredentialEntry::Valid(valid) => valid,
        };

        let tenant_id = valid.tenant_id().to_string();

        if !self.mode.is_due(valid.record(), now, self.naive_offset) {
            debug!(tenant_id = %tenant_id, expires_at = ?valid.record().expires_at(), "Token not due for refresh");
            return (
                CredentialEntry::Valid(valid),
                TenantRefreshResult {
                    tenant_id,
                    status: TenantRefreshStatus::NotDue,
                },
            );
        }

        let credential = &valid;
        let exchanger = &self.exchanger;
        let outcome = self
            .retry
            .run(&tenant_id, ExchangeError::is_retryable, move |_| exchanger.exchange(credential))
            .await;

        let status = match outcome.result {
            Ok(grant) => {
                let previous = fingerprint(valid.refresh_token());
                let rotated = valid.apply_grant(grant);
                if rotated {
                    info!(
                        tenant_id = %tenant_id,
                        attempts = outcome.attempts,
                        previous = %previous,
                        current = %fingerprint(valid.refresh_token()),
                        "Token refreshed"
                    );
                } else {
                    warn!(
                        tenant_id = %tenant_id,
                        fingerprint = %previous,
                        "Token refresh reported success but the refresh token did not rotate"
                    );
                }
                TenantRefreshStatus::Refreshed { rotated }
            }
            Err(err) => {
                error!(
                    tenant_id = %tenant_id,
                    attempts = outcome.attempts,
                    error = %err,
                    "Token refresh failed"
                );
                TenantRefreshStatus::Failed {
                    attempts: outcome.attempts,
                    reason: err.to_string(),
                }
            }
        };

        (CredentialEntry::Valid(valid), TenantRefreshResult { tenant_id, status })
    }

    async fn report(&self, summary: &RefreshSummary) {
        self.events.try_emit(
            "refresh.completed",
            Some(json!({
                "mode": self.mode.to_string(),
                "succeeded": summary.succeeded(),
                "failed": summary.failed(),
                "skipped": summary.skipped(),
                "not_due": summary.not_due(),
            })),
        );

        if !summary.has_failures() {
            return;
        }

        let mut notification = Notification::new(format!(
            "Token refresh failed for {} tenant(s)",
            summary.failed()
        ));
        for result in &summary.results {
            if let TenantRefreshStatus::Failed { .. } = result.status {
                notification = notification.with_section(format!("*{}*: {}", result.tenant_id, result.status));
            }
        }
        self.notifier.notify(&notification).await;
    }

    /// Loads the set, refreshes it and writes it back exactly once.
    pub async fn run(&self, store: &SecretStore) -> Result<RefreshRun> {
        let loaded = store.load_latest().await?;
        let set = CredentialSet::from_bytes(&loaded.payload)?;

        info!(
            tenants = set.len(),
            source = %loaded.store_backend,
            version = %loaded.version,
            mode = %self.mode,
            concurrency = self.concurrency,
            "Starting token refresh"
        );

        let (updated, summary) = self.refresh_all(set).await;
        let version = store.save_new_version(&updated.to_bytes()?).await?;

        if summary.has_failures() {
            warn!(version = %version, "Token refresh finished: {}", summary);
        } else {
            info!(version = %version, "Token refresh finished: {}", summary);
        }

        Ok(RefreshRun { summary, version })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::refresh::exchange::MockTokenExchanger;
    use crate::refresh::TokenGrant;
    use crate::testing::RecordingNotifier;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn record(tenant: &str, expires_at: Option<&str>) -> CredentialRecord {
        let record = CredentialRecord::default()
            .with_field("tenant_id", tenant)
            .with_field("client_id", format!("client-{tenant}"))
            .with_field("client_secret", format!("secret-{tenant}"))
            .with_field("refresh_token", format!("refresh-{tenant}"))
            .with_field("access_token", format!("access-{tenant}"));
        match expires_at {
            Some(at) => record.with_field("expires_at", at),
            None => record,
        }
    }

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn grant_for(tenant: &str) -> TokenGrant {
        TokenGrant {
            access_token: format!("new-access-{tenant}"),
            expires_at: "2030-01-01T00:00:00Z".to_string(),
            refresh_token: Some(format!("new-refresh-{tenant}")),
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new().with_base_delay_ms(1)
    }

    #[test]
    fn test_time_based_due() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let mode = RefreshMode::default();

        assert!(mode.is_due(&record("a", Some("2026-01-01T12:30:00Z")), now, utc()));
        assert!(!mode.is_due(&record("a", Some("2026-01-01T14:00:00Z")), now, utc()));
        assert!(mode.is_due(&record("a", None), now, utc()));
        assert!(mode.is_due(&record("a", Some("soon")), now, utc()));
        assert!(RefreshMode::Forced.is_due(&record("a", Some("2099-01-01T00:00:00Z")), now, utc()));
    }

    #[test]
    fn test_summary_display() {
        let summary = RefreshSummary {
            results: vec![
                TenantRefreshResult {
                    tenant_id: "a".into(),
                    status: TenantRefreshStatus::Refreshed { rotated: true },
                },
                TenantRefreshResult {
                    tenant_id: "b".into(),
                    status: TenantRefreshStatus::Failed {
                        attempts: 3,
                        reason: "HTTP 500".into(),
                    },
                },
            ],
        };

        assert_eq!(summary.to_string(), "1 succeeded, 1 failed, 0 skipped, 0 not due");
        assert!(matches!(
            summary.failures().as_slice(),
            [ShopflowError::RefreshFailed { attempts: 3, .. }]
        ));
    }

    #[tokio::test]
    async fn test_refresh_all_skips_and_not_due() {
        let mut exchanger = MockTokenExchanger::new();
        exchanger
            .expect_exchange()
            .withf(|c| c.tenant_id() == "due")
            .times(1)
            .returning(|_| Ok(grant_for("due")));

        let incomplete = record("broken", None).with_field("client_secret", serde_json::Value::Null);

        let set = CredentialSet::new(vec![
            record("due", Some("2000-01-01T00:00:00Z")),
            incomplete.clone(),
            record("later", Some("2099-01-01T00:00:00Z")),
        ]);

        let engine = RefreshEngine::new(Arc::new(exchanger)).with_retry(fast_retry());
        let (updated, summary) = engine.refresh_all(set).await;

        assert_eq!(summary.to_string(), "1 succeeded, 0 failed, 1 skipped, 1 not due");
        assert_eq!(updated.records()[1], incomplete);
        assert_eq!(updated.records()[0].refresh_token(), Some("new-refresh-due"));
        assert_eq!(updated.records()[2], record("later", Some("2099-01-01T00:00:00Z")));
    }

    #[tokio::test]
    async fn test_malformed_response_not_retried() {
        let mut exchanger = MockTokenExchanger::new();
        exchanger
            .expect_exchange()
            .times(1)
            .returning(|_| Err(ExchangeError::MalformedResponse("no access_token".into())));

        let notifier = Arc::new(RecordingNotifier::new());
        let engine = RefreshEngine::new(Arc::new(exchanger))
            .with_retry(fast_retry())
            .with_mode(RefreshMode::Forced)
            .with_notifier(notifier.clone());

        let (_, summary) = engine.refresh_all(CredentialSet::new(vec![record("a", None)])).await;

        assert_eq!(
            summary.status_of("a"),
            Some(&TenantRefreshStatus::Failed {
                attempts: 1,
                reason: "malformed token response: no access_token".into()
            })
        );
        assert_eq!(notifier.len(), 1);
    }

    #[tokio::test]
    async fn test_unrotated_token_is_reported() {
        let mut exchanger = MockTokenExchanger::new();
        exchanger.expect_exchange().returning(|c| {
            Ok(TokenGrant {
                access_token: "new-access".into(),
                expires_at: "2030-01-01T00:00:00Z".into(),
                refresh_token: Some(c.refresh_token().to_string()),
            })
        });

        let engine = RefreshEngine::new(Arc::new(exchanger)).with_mode(RefreshMode::Forced);
        let (updated, summary) = engine.refresh_all(CredentialSet::new(vec![record("a", None)])).await;

        assert_eq!(summary.status_of("a"), Some(&TenantRefreshStatus::Refreshed { rotated: false }));
        assert_eq!(updated.records()[0].access_token(), Some("new-access"));
        assert_eq!(updated.records()[0].refresh_token(), Some("refresh-a"));
    }

    #[tokio::test]
    async fn test_panicking_worker_keeps_record() {
        let mut exchanger = MockTokenExchanger::new();
        exchanger
            .expect_exchange()
            .returning(|_| panic!("exchanger bug"));

        let events = Arc::new(CollectingEventSink::new());
        let engine = RefreshEngine::new(Arc::new(exchanger))
            .with_mode(RefreshMode::Forced)
            .with_event_sink(events.clone());

        let input = CredentialSet::new(vec![record("a", None)]);
        let (updated, summary) = engine.refresh_all(input.clone()).await;

        assert_eq!(updated, input);
        assert_eq!(summary.failed(), 1);
        assert_eq!(events.event_types(), vec!["refresh.completed"]);
    }

    #[tokio::test]
    async fn test_naive_expiry_read_in_business_offset() {
        let mut exchanger = MockTokenExchanger::new();
        exchanger.expect_exchange().times(1).returning(|c| Ok(grant_for(c.tenant_id())));
        let exchanger: Arc<dyn TokenExchanger> = Arc::new(exchanger);

        // Thirty minutes ahead in +09:00 wall time, nine and a half hours ahead if misread as UTC.
        let jst = FixedOffset::east_opt(9 * 3600).unwrap();
        let local_expiry = (Utc::now().with_timezone(&jst) + ChronoDuration::minutes(30))
            .format("%Y-%m-%dT%H:%M:%S")
            .to_string();
        let set = CredentialSet::new(vec![record("a", Some(&local_expiry))]);

        let as_utc = RefreshEngine::new(exchanger.clone());
        let (_, summary) = as_utc.refresh_all(set.clone()).await;
        assert_eq!(summary.status_of("a"), Some(&TenantRefreshStatus::NotDue));

        let as_jst = RefreshEngine::new(exchanger).with_naive_offset(jst);
        assert_eq!(as_jst.naive_offset(), jst);
        let (_, summary) = as_jst.refresh_all(set).await;
        assert_eq!(summary.status_of("a"), Some(&TenantRefreshStatus::Refreshed { rotated: true }));
    }

    #[tokio::test]
    async fn test_refresh_all_with_zero_bound_still_runs() {
        let mut exchanger = MockTokenExchanger::new();
        exchanger.expect_exchange().times(4).returning(|c| Ok(grant_for(c.tenant_id())));

        let set = CredentialSet::new(["a", "b", "c", "d"].iter().map(|t| record(t, None)).collect());
        let engine = RefreshEngine::new(Arc::new(exchanger)).with_mode(RefreshMode::Forced);
        let (updated, summary) = engine.refresh_all_with(set, 0).await;

        assert_eq!(summary.succeeded(), 4);
        let tenants: Vec<&str> = updated.records().iter().filter_map(CredentialRecord::tenant_id).collect();
        assert_eq!(tenants, vec!["a", "b", "c", "d"]);
    }
}
