//! Local filesystem object storage.
//!
//! Implements `ObjectStorage` from `autoflow-core` with every blob stored at
//! `{root}/{key}`. Suits single-host deployments where the data directory is
//! shared by every process booting instances.

use std::path::{Component, Path, PathBuf};

use autoflow_core::repository::object_storage::{ObjectStorage, ObjectStorageError};
use futures_util::future::BoxFuture;

/// Backend ID used by [`LocalObjectStorage::in_data_dir`].
pub const DEFAULT_OSS_ID: &str = "local";

/// Filesystem-backed object storage rooted at one directory.
pub struct LocalObjectStorage {
    root: PathBuf,
    oss_id: String,
}

impl LocalObjectStorage {
    /// Create a backend with ID `oss_id` storing blobs under `root`.
    pub fn new(root: PathBuf, oss_id: impl Into<String>) -> Self {
        Self {
            root,
            oss_id: oss_id.into(),
        }
    }

    /// Backend with the default ID, rooted at `{data_dir}/objects`.
    pub fn in_data_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join("objects"), DEFAULT_OSS_ID)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to its path, rejecting IDs of other backends and keys
    /// that would escape the root.
    fn path_for(&self, oss_id: &str, key: &str) -> Result<PathBuf, ObjectStorageError> {
        if oss_id != self.oss_id {
            return Err(ObjectStorageError::Unavailable);
        }
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(ObjectStorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    async fn upload_inner(&self, oss_id: &str, key: &str, data: Vec<u8>) -> Result<(), ObjectStorageError> {
        let path = self.path_for(oss_id, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ObjectStorageError::Io(format!("failed to create directory: {e}")))?;
        }
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| ObjectStorageError::Io(format!("failed to write {key}: {e}")))?;
        tracing::debug!(key, "blob stored");
        Ok(())
    }

    async fn download_inner(&self, oss_id: &str, key: &str) -> Result<Vec<u8>, ObjectStorageError> {
        let path = self.path_for(oss_id, key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ObjectStorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(ObjectStorageError::Io(format!("failed to read {key}: {e}"))),
        }
    }

    async fn delete_inner(&self, oss_id: &str, key: &str) -> Result<(), ObjectStorageError> {
        let path = self.path_for(oss_id, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ObjectStorageError::Io(format!("failed to delete {key}: {e}"))),
        }
    }
}

impl ObjectStorage for LocalObjectStorage {
    fn get_available(&self) -> BoxFuture<'_, Result<String, ObjectStorageError>> {
        Box::pin(async move { Ok(self.oss_id.clone()) })
    }

    fn upload<'a>(
        &'a self,
        oss_id: &'a str,
        key: &'a str,
        data: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), ObjectStorageError>> {
        Box::pin(self.upload_inner(oss_id, key, data))
    }

    fn download<'a>(
        &'a self,
        oss_id: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Vec<u8>, ObjectStorageError>> {
        Box::pin(self.download_inner(oss_id, key))
    }

    fn delete<'a>(
        &'a self,
        oss_id: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<(), ObjectStorageError>> {
        Box::pin(self.delete_inner(oss_id, key))
    }
}
