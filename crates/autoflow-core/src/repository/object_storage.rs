//! Object storage gateway trait.
//!
//! Object-safe (boxed futures) so the engine can hold any backend behind
//! `Arc<dyn ObjectStorage>`. Implementations live in autoflow-infra.

use futures_util::future::BoxFuture;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObjectStorageError {
    #[error("no object storage backend available")]
    Unavailable,

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("object storage I/O error: {0}")]
    Io(String),
}

/// Blob storage addressed by backend ID + key.
pub trait ObjectStorage: Send + Sync {
    /// Pick a backend that currently accepts uploads. Returns its ID.
    fn get_available(&self) -> BoxFuture<'_, Result<String, ObjectStorageError>>;

    fn upload<'a>(
        &'a self,
        oss_id: &'a str,
        key: &'a str,
        data: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), ObjectStorageError>>;

    fn download<'a>(
        &'a self,
        oss_id: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Vec<u8>, ObjectStorageError>>;

    /// Remove a blob. Deleting a missing blob is not an error.
    fn delete<'a>(
        &'a self,
        oss_id: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<(), ObjectStorageError>>;
}
