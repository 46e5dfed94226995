//! OAuth token refresh for every tenant in a credential set.
//!
//! [`RefreshEngine`] loads the set from a [`crate::secrets::SecretStore`],
//! refreshes due records concurrently through a [`TokenExchanger`] under a
//! [`RetryPolicy`], and writes the whole set back as one new version.

pub mod engine;
pub mod exchange;
pub mod retry;


pub use engine::{
    RefreshEngine, RefreshMode, RefreshRun, RefreshSummary, TenantRefreshResult, TenantRefreshStatus,
    DEFAULT_CONCURRENCY, DEFAULT_EXPIRY_BUFFER,
};
pub use exchange::{HttpTokenExchanger, TokenExchanger, TokenGrant, TENANT_PLACEHOLDER};
pub use retry::{BackoffStrategy, JitterStrategy, RetryOutcome, RetryPolicy};
