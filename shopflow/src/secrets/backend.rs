//! Backend traits for the tiered secret store.

use crate::errors::BackendError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Which backend a secret version came from or went to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// The versioned secret service.
    Primary,
    /// The blob store.
    Fallback,
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// A version as reported by a single backend.
#[derive(Clone, PartialEq, Eq)]
pub struct BackendVersion {
    /// Backend-assigned version or generation.
    pub version: String,
    /// Opaque payload.
    pub payload: Vec<u8>,
}

impl fmt::Debug for BackendVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendVersion")
            .field("version", &self.version)
            .field("payload_bytes", &self.payload.len())
            .finish()
    }
}

/// Identifies a written version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionId {
    /// Backend that holds the version.
    pub backend: StoreBackend,
    /// Backend-assigned version.
    pub version: String,
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.backend, self.version)
    }
}

/// One immutable payload snapshot read from the store.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretVersion {
    /// The payload, a serialized credential set.
    pub payload: Vec<u8>,
    /// Backend the payload was read from.
    pub store_backend: StoreBackend,
    /// Backend-assigned version.
    pub version: String,
}

impl SecretVersion {
    /// Short SHA-256 digest of the payload, safe to log.
    #[must_use]
    pub fn digest(&self) -> String {
        let hash = Sha256::digest(&self.payload);
        hex::encode(&hash[..6])
    }

    /// Returns the version id.
    #[must_use]
    pub fn id(&self) -> VersionId {
        VersionId {
            backend: self.store_backend,
            version: self.version.clone(),
        }
    }
}

impl fmt::Debug for SecretVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretVersion")
            .field("store_backend", &self.store_backend)
            .field("version", &self.version)
            .field("digest", &self.digest())
            .finish()
    }
}

/// A secret service that keeps every written version.
///
/// Reads always target the latest version and writes always append a new one.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VersionedSecretService: Send + Sync {
    /// Reads the latest version of a secret.
    async fn access_latest(&self, secret_id: &str) -> Result<BackendVersion, BackendError>;

    /// Appends a new version and returns its id.
    async fn add_version(&self, secret_id: &str, payload: &[u8]) -> Result<String, BackendError>;

    /// Creates an empty secret container.
    async fn create(&self, secret_id: &str) -> Result<(), BackendError>;
}

/// A flat object store addressed by path.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Downloads an object.
    async fn download(&self, object_path: &str) -> Result<BackendVersion, BackendError>;

    /// Uploads an object and returns its generation.
    async fn upload(&self, object_path: &str, payload: &[u8]) -> Result<String, BackendError>;

    /// Deletes an object.
    async fn delete(&self, object_path: &str) -> Result<(), BackendError>;
}
