//! In-memory secret backends.
//!
//! Useful for tests and dry runs. Both backends can be told to fail reads so
//! fallback behavior can be exercised without a network.

use super::backend::{BackendVersion, BlobStore, VersionedSecretService};
use crate::errors::BackendError;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Versioned secret service held in memory.
#[derive(Debug, Default)]
pub struct InMemorySecretService {
    secrets: RwLock<HashMap<String, Vec<Vec<u8>>>>,
    read_failure: RwLock<Option<BackendError>>,
    write_failure: RwLock<Option<BackendError>>,
    writes: AtomicUsize,
}

impl InMemorySecretService {
    /// Creates an empty service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a service holding one version of `secret_id`.
    #[must_use]
    pub fn with_secret(secret_id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        let service = Self::new();
        service
            .secrets
            .write()
            .insert(secret_id.into(), vec![payload.into()]);
        service
    }

    /// Makes every read fail with `error`.
    pub fn fail_reads(&self, error: BackendError) {
        *self.read_failure.write() = Some(error);
    }

    /// Makes every write fail with `error`.
    pub fn fail_writes(&self, error: BackendError) {
        *self.write_failure.write() = Some(error);
    }

    /// Number of successful `add_version` calls.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// All versions of a secret, oldest first.
    #[must_use]
    pub fn versions(&self, secret_id: &str) -> Vec<Vec<u8>> {
        self.secrets
            .read()
            .get(secret_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl VersionedSecretService for InMemorySecretService {
    async fn access_latest(&self, secret_id: &str) -> Result<BackendVersion, BackendError> {
        if let Some(err) = self.read_failure.read().clone() {
            return Err(err);
        }

        let secrets = self.secrets.read();
        let versions = secrets
            .get(secret_id)
            .ok_or_else(|| BackendError::NotFound(format!("secret '{secret_id}'")))?;
        let payload = versions
            .last()
            .ok_or_else(|| BackendError::NotFound(format!("secret '{secret_id}' has no versions")))?;

        Ok(BackendVersion {
            version: versions.len().to_string(),
            payload: payload.clone(),
        })
    }

    async fn add_version(&self, secret_id: &str, payload: &[u8]) -> Result<String, BackendError> {
        if let Some(err) = self.write_failure.read().clone() {
            return Err(err);
        }

        let mut secrets = self.secrets.write();
        let versions = secrets
            .get_mut(secret_id)
            .ok_or_else(|| BackendError::NotFound(format!("secret '{secret_id}'")))?;
        versions.push(payload.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);

        Ok(versions.len().to_string())
    }

    async fn create(&self, secret_id: &str) -> Result<(), BackendError> {
        self.secrets
            .write()
            .entry(secret_id.to_string())
            .or_default();
        Ok(())
    }
}

/// Blob store held in memory.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    objects: DashMap<String, (u64, Vec<u8>)>,
    generation: AtomicU64,
    read_failure: RwLock<Option<BackendError>>,
    uploads: AtomicUsize,
    deletes: AtomicUsize,
}

impl InMemoryBlobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding one object.
    #[must_use]
    pub fn with_object(object_path: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        let store = Self::new();
        let generation = store.generation.fetch_add(1, Ordering::SeqCst) + 1;
        store
            .objects
            .insert(object_path.into(), (generation, payload.into()));
        store
    }

    /// Makes every download fail with `error`.
    pub fn fail_reads(&self, error: BackendError) {
        *self.read_failure.write() = Some(error);
    }

    /// Number of successful uploads.
    #[must_use]
    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    /// Number of successful deletes.
    #[must_use]
    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Current payload of an object.
    #[must_use]
    pub fn object(&self, object_path: &str) -> Option<Vec<u8>> {
        self.objects.get(object_path).map(|entry| entry.1.clone())
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn download(&self, object_path: &str) -> Result<BackendVersion, BackendError> {
        if let Some(err) = self.read_failure.read().clone() {
            return Err(err);
        }

        self.objects
            .get(object_path)
            .map(|entry| BackendVersion {
                version: entry.0.to_string(),
                payload: entry.1.clone(),
            })
            .ok_or_else(|| BackendError::NotFound(format!("object '{object_path}'")))
    }

    async fn upload(&self, object_path: &str, payload: &[u8]) -> Result<String, BackendError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.objects
            .insert(object_path.to_string(), (generation, payload.to_vec()));
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(generation.to_string())
    }

    async fn delete(&self, object_path: &str) -> Result<(), BackendError> {
        self.objects
            .remove(object_path)
            .map(|_| {
                self.deletes.fetch_add(1, Ordering::SeqCst);
            })
            .ok_or_else(|| BackendError::NotFound(format!("object '{object_path}'")))
    }
}
