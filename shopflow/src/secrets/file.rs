//! Filesystem-backed secret backends.
//!
//! `FileSecretService` keeps one directory per secret with one file per
//! version (`<root>/<secret_id>/<n>`); `FileBlobStore` maps object paths
//! onto files under a root directory. Writes go through a temporary file and
//! a rename so readers never see a partially written payload.

use super::backend::{BackendVersion, BlobStore, VersionedSecretService};
use crate::errors::BackendError;
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Component, Path, PathBuf};
use tokio::fs;

/// Versioned secret service on the local filesystem.
#[derive(Debug, Clone)]
pub struct FileSecretService {
    root: PathBuf,
}

impl FileSecretService {
    /// Creates a service rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn secret_dir(&self, secret_id: &str) -> Result<PathBuf, BackendError> {
        if secret_id.is_empty()
            || secret_id.contains('/')
            || secret_id.contains('\\')
            || secret_id.starts_with('.')
        {
            return Err(BackendError::Invalid(format!(
                "secret id '{secret_id}' must be a plain name"
            )));
        }
        Ok(self.root.join(secret_id))
    }

    async fn latest_version(dir: &Path) -> Result<Option<u64>, BackendError> {
        let mut entries = fs::read_dir(dir).await?;
        let mut latest = None;

        while let Some(entry) = entries.next_entry().await? {
            let Some(version) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u64>().ok())
            else {
                continue;
            };
            latest = latest.max(Some(version));
        }

        Ok(latest)
    }
}

#[async_trait]
impl VersionedSecretService for FileSecretService {
    async fn access_latest(&self, secret_id: &str) -> Result<BackendVersion, BackendError> {
        let dir = self.secret_dir(secret_id)?;
        let version = Self::latest_version(&dir)
            .await?
            .ok_or_else(|| BackendError::NotFound(format!("secret '{secret_id}' has no versions")))?;
        let payload = fs::read(dir.join(version.to_string())).await?;

        Ok(BackendVersion {
            version: version.to_string(),
            payload,
        })
    }

    async fn add_version(&self, secret_id: &str, payload: &[u8]) -> Result<String, BackendError> {
        let dir = self.secret_dir(secret_id)?;
        if !fs::try_exists(&dir).await? {
            return Err(BackendError::NotFound(format!("secret '{secret_id}'")));
        }

        let next = Self::latest_version(&dir).await?.map_or(1, |v| v + 1);
        write_atomically(&dir.join(next.to_string()), payload).await?;

        Ok(next.to_string())
    }

    async fn create(&self, secret_id: &str) -> Result<(), BackendError> {
        let dir = self.secret_dir(secret_id)?;
        fs::create_dir_all(&dir).await?;
        Ok(())
    }
}

/// Blob store on the local filesystem.
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    /// Creates a store rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_file(&self, object_path: &str) -> Result<PathBuf, BackendError> {
        let relative = Path::new(object_path);
        let plain = !object_path.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !plain {
            return Err(BackendError::Invalid(format!(
                "object path '{object_path}' must be relative without '..'"
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn download(&self, object_path: &str) -> Result<BackendVersion, BackendError> {
        let file = self.object_file(object_path)?;
        let payload = fs::read(&file).await?;
        let modified = fs::metadata(&file)
            .await?
            .modified()
            .ok()
            .map(chrono::DateTime::<Utc>::from);

        Ok(BackendVersion {
            version: modified.map_or_else(|| "unknown".to_string(), |m| m.timestamp_micros().to_string()),
            payload,
        })
    }

    async fn upload(&self, object_path: &str, payload: &[u8]) -> Result<String, BackendError> {
        let file = self.object_file(object_path)?;
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent).await?;
        }
        write_atomically(&file, payload).await?;
        Ok(Utc::now().timestamp_micros().to_string())
    }

    async fn delete(&self, object_path: &str) -> Result<(), BackendError> {
        let file = self.object_file(object_path)?;
        fs::remove_file(&file).await?;
        Ok(())
    }
}

async fn write_atomically(target: &Path, payload: &[u8]) -> Result<(), BackendError> {
    let file_name = target
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| BackendError::Invalid(format!("bad target path {}", target.display())))?;
    let tmp = target.with_file_name(format!(".{file_name}.tmp"));

    fs::write(&tmp, payload).await?;
    fs::rename(&tmp, target).await?;
    Ok(())
}
