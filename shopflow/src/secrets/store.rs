//! Tiered secret store over a primary and a fallback backend.

use super::backend::{BlobStore, SecretVersion, StoreBackend, VersionId, VersionedSecretService};
use crate::errors::{Result, ShopflowError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Which backend receives new versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreMode {
    /// Write to the versioned secret service.
    #[default]
    Primary,
    /// Write to the blob store.
    Fallback,
}

impl fmt::Display for StoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

impl std::str::FromStr for StoreMode {
    type Err = ShopflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" => Ok(Self::Primary),
            "fallback" => Ok(Self::Fallback),
            other => Err(ShopflowError::config(format!(
                "unknown store mode '{other}', expected 'primary' or 'fallback'"
            ))),
        }
    }
}

/// Get-latest / put-new-version access to the credential payload.
///
/// Reads try the primary backend and fall back to the blob store on any
/// error. Writes go to the backend selected by [`StoreMode`] and always
/// create a new version.
#[derive(Clone)]
pub struct SecretStore {
    primary: Arc<dyn VersionedSecretService>,
    fallback: Arc<dyn BlobStore>,
    secret_id: String,
    object_path: String,
    mode: StoreMode,
}

impl fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretStore")
            .field("secret_id", &self.secret_id)
            .field("object_path", &self.object_path)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl SecretStore {
    /// Creates a store writing to the primary backend.
    pub fn new(
        primary: Arc<dyn VersionedSecretService>,
        fallback: Arc<dyn BlobStore>,
        secret_id: impl Into<String>,
        object_path: impl Into<String>,
    ) -> Self {
        Self {
            primary,
            fallback,
            secret_id: secret_id.into(),
            object_path: object_path.into(),
            mode: StoreMode::default(),
        }
    }

    /// Sets the write mode.
    #[must_use]
    pub fn with_mode(mut self, mode: StoreMode) -> Self {
        self.mode = mode;
        self
    }

    /// Returns the write mode.
    #[must_use]
    pub fn mode(&self) -> StoreMode {
        self.mode
    }

    /// Reads the latest payload.
    ///
    /// Fails with [`ShopflowError::CredentialUnavailable`] only when both
    /// backends fail. A caller never sees a partial payload.
    pub async fn load_latest(&self) -> Result<SecretVersion> {
        let primary_err = match self.primary.access_latest(&self.secret_id).await {
            Ok(found) => {
                let version = SecretVersion {
                    payload: found.payload,
                    store_backend: StoreBackend::Primary,
                    version: found.version,
                };
                debug!(
                    secret_id = %self.secret_id,
                    version = %version.version,
                    digest = %version.digest(),
                    "Loaded secret from primary backend"
                );
                return Ok(version);
            }
            Err(err) => err,
        };

        warn!(
            secret_id = %self.secret_id,
            object_path = %self.object_path,
            error = %primary_err,
            "Primary secret backend failed, falling back to blob store"
        );

        match self.fallback.download(&self.object_path).await {
            Ok(found) => {
                let version = SecretVersion {
                    payload: found.payload,
                    store_backend: StoreBackend::Fallback,
                    version: found.version,
                };
                info!(
                    object_path = %self.object_path,
                    version = %version.version,
                    digest = %version.digest(),
                    "Loaded secret from fallback backend"
                );
                Ok(version)
            }
            Err(fallback_err) => {
                error!(
                    secret_id = %self.secret_id,
                    object_path = %self.object_path,
                    primary_error = %primary_err,
                    fallback_error = %fallback_err,
                    "Both secret backends failed"
                );
                Err(ShopflowError::CredentialUnavailable {
                    primary: primary_err.to_string(),
                    fallback: fallback_err.to_string(),
                })
            }
        }
    }

    /// Writes `payload` as a new version on the active backend.
    ///
    /// Prior versions are never deleted on the primary backend. On the blob
    /// store the object is deleted and re-uploaded so the next read sees the
    /// fresh generation.
    pub async fn save_new_version(&self, payload: &[u8]) -> Result<VersionId> {
        let id = match self.mode {
            StoreMode::Primary => self.save_primary(payload).await?,
            StoreMode::Fallback => self.save_fallback(payload).await?,
        };

        info!(
            version = %id,
            bytes = payload.len(),
            "Saved new secret version"
        );
        Ok(id)
    }

    async fn save_primary(&self, payload: &[u8]) -> Result<VersionId> {
        let version = match self.primary.add_version(&self.secret_id, payload).await {
            Ok(version) => version,
            Err(err) if err.is_not_found() => {
                info!(secret_id = %self.secret_id, "Secret does not exist yet, creating it");
                self.primary.create(&self.secret_id).await?;
                self.primary.add_version(&self.secret_id, payload).await?
            }
            Err(err) => return Err(err.into()),
        };

        Ok(VersionId {
            backend: StoreBackend::Primary,
            version,
        })
    }

    async fn save_fallback(&self, payload: &[u8]) -> Result<VersionId> {
        match self.fallback.delete(&self.object_path).await {
            Ok(()) => debug!(object_path = %self.object_path, "Deleted previous object"),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }

        let version = self.fallback.upload(&self.object_path, payload).await?;
        Ok(VersionId {
            backend: StoreBackend::Fallback,
            version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::BackendError;
    use crate::secrets::backend::{BackendVersion, MockBlobStore, MockVersionedSecretService};
    use crate::secrets::memory::{InMemoryBlobStore, InMemorySecretService};
    use mockall::predicate::eq;
    use pretty_assertions::assert_eq;
    use tracing_test::traced_test;

    const THREE_RECORDS: &str = r#"[
        {"tenant_id": "a", "client_id": "ca", "client_secret": "sa", "refresh_token": "ra"},
        {"tenant_id": "b", "client_id": "cb", "client_secret": "sb", "refresh_token": "rb"},
        {"tenant_id": "c", "client_id": "cc", "client_secret": "sc", "refresh_token": "rc"}
    ]"#;

    #[tokio::test]
    #[traced_test]
    async fn test_load_latest_falls_back_with_one_warning() {
        let mut primary = MockVersionedSecretService::new();
        primary
            .expect_access_latest()
            .with(eq("tokens"))
            .times(1)
            .returning(|_| Err(BackendError::NotFound("tokens".to_string())));

        let mut fallback = MockBlobStore::new();
        fallback
            .expect_download()
            .with(eq("creds/tokens.json"))
            .times(1)
            .returning(|_| {
                Ok(BackendVersion {
                    version: "42".to_string(),
                    payload: THREE_RECORDS.as_bytes().to_vec(),
                })
            });

        let store = SecretStore::new(Arc::new(primary), Arc::new(fallback), "tokens", "creds/tokens.json");
        let loaded = store.load_latest().await.unwrap();

        assert_eq!(loaded.store_backend, StoreBackend::Fallback);
        assert_eq!(loaded.payload, THREE_RECORDS.as_bytes().to_vec());

        logs_assert(|lines: &[&str]| {
            let warnings = lines
                .iter()
                .filter(|line| line.contains("WARN") && line.contains("falling back"))
                .count();
            if warnings == 1 {
                Ok(())
            } else {
                Err(format!("expected 1 fallback warning, saw {warnings}"))
            }
        });
    }

    #[tokio::test]
    async fn test_load_latest_prefers_primary() {
        let primary = InMemorySecretService::with_secret("tokens", b"primary".to_vec());
        let fallback = InMemoryBlobStore::with_object("creds.json", b"fallback".to_vec());

        let store = SecretStore::new(Arc::new(primary), Arc::new(fallback), "tokens", "creds.json");
        let loaded = store.load_latest().await.unwrap();

        assert_eq!(loaded.store_backend, StoreBackend::Primary);
        assert_eq!(loaded.payload, b"primary".to_vec());
        assert_eq!(loaded.version, "1");
    }

    #[tokio::test]
    async fn test_load_latest_both_fail() {
        let primary = InMemorySecretService::new();
        primary.fail_reads(BackendError::PermissionDenied("iam".to_string()));
        let fallback = InMemoryBlobStore::new();

        let store = SecretStore::new(Arc::new(primary), Arc::new(fallback), "tokens", "creds.json");
        let err = store.load_latest().await.unwrap_err();

        match err {
            ShopflowError::CredentialUnavailable { primary, fallback } => {
                assert!(primary.contains("iam"));
                assert!(fallback.contains("creds.json"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_save_creates_missing_secret() {
        let mut primary = MockVersionedSecretService::new();
        let mut seq = mockall::Sequence::new();
        primary
            .expect_add_version()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(BackendError::NotFound("tokens".to_string())));
        primary
            .expect_create()
            .with(eq("tokens"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        primary
            .expect_add_version()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok("1".to_string()));

        let store = SecretStore::new(
            Arc::new(primary),
            Arc::new(MockBlobStore::new()),
            "tokens",
            "creds.json",
        );
        let id = store.save_new_version(b"[]").await.unwrap();

        assert_eq!(id.backend, StoreBackend::Primary);
        assert_eq!(id.version, "1");
    }

    #[tokio::test]
    async fn test_save_primary_keeps_history() {
        let primary = Arc::new(InMemorySecretService::with_secret("tokens", b"v1".to_vec()));
        let store = SecretStore::new(
            primary.clone(),
            Arc::new(InMemoryBlobStore::new()),
            "tokens",
            "creds.json",
        );

        store.save_new_version(b"v2").await.unwrap();

        assert_eq!(primary.versions("tokens"), vec![b"v1".to_vec(), b"v2".to_vec()]);
    }

    #[tokio::test]
    async fn test_save_fallback_deletes_then_uploads() {
        let fallback = Arc::new(InMemoryBlobStore::with_object("creds.json", b"old".to_vec()));
        let primary = Arc::new(InMemorySecretService::new());
        let store = SecretStore::new(primary.clone(), fallback.clone(), "tokens", "creds.json")
            .with_mode(StoreMode::Fallback);

        let id = store.save_new_version(b"new").await.unwrap();

        assert_eq!(id.backend, StoreBackend::Fallback);
        assert_eq!(fallback.delete_count(), 1);
        assert_eq!(fallback.upload_count(), 1);
        assert_eq!(fallback.object("creds.json"), Some(b"new".to_vec()));
        assert_eq!(primary.write_count(), 0);
    }

    #[tokio::test]
    async fn test_save_fallback_tolerates_missing_object() {
        let fallback = Arc::new(InMemoryBlobStore::new());
        let store = SecretStore::new(
            Arc::new(InMemorySecretService::new()),
            fallback.clone(),
            "tokens",
            "creds.json",
        )
        .with_mode(StoreMode::Fallback);

        store.save_new_version(b"first").await.unwrap();

        assert_eq!(fallback.object("creds.json"), Some(b"first".to_vec()));
    }

    #[test]
    fn test_store_mode_parse() {
        assert_eq!("Fallback".parse::<StoreMode>().unwrap(), StoreMode::Fallback);
        assert!("secondary".parse::<StoreMode>().is_err());
    }
}
