//! Offloading of oversized DagInstance fields to object storage.
//!
//! On every VM stop the ShareData snapshot and the continuation dump are
//! measured; anything above `max_inline_size` is uploaded and replaced on
//! the record by an [`ExtData`] descriptor. Boot reverses the process with
//! [`ExtDataOffloader::load_ext_data`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use autoflow_types::config::EngineConfig;
use autoflow_types::ext_data::{ExtData, ExtDataField};
use autoflow_types::instance::{DagInstance, DagInstancePatch};
use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::repository::object_storage::{ObjectStorage, ObjectStorageError};
use crate::repository::store::Store;
use crate::service::background::BackgroundTasks;

#[derive(Debug, Error)]
pub enum ExtDataError {
    #[error(transparent)]
    Storage(#[from] ObjectStorageError),

    #[error("invalid {field} payload: {message}")]
    InvalidPayload { field: ExtDataField, message: String },

    #[error("failed to encode sharedata: {0}")]
    Encode(#[from] serde_json::Error),
}

pub struct ExtDataOffloader<S: Store> {
    store: Arc<S>,
    objects: Arc<dyn ObjectStorage>,
    config: Arc<EngineConfig>,
    background: BackgroundTasks,
    save_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl<S: Store> ExtDataOffloader<S> {
    pub fn new(
        store: Arc<S>,
        objects: Arc<dyn ObjectStorage>,
        config: Arc<EngineConfig>,
        background: BackgroundTasks,
    ) -> Self {
        Self {
            store,
            objects,
            config,
            background,
            save_locks: DashMap::new(),
        }
    }

    fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.config.blob_retry_delay_ms)
    }

    fn attempts(&self) -> u32 {
        self.config.blob_max_retries.saturating_add(1)
    }

    /// Move oversized `share_data`/`dump` values of `patch` to object storage.
    ///
    /// Offloaded fields are cleared inline and their descriptor is set on the
    /// patch; fields within the limit clear any previous descriptor. Runs
    /// exclusively per instance. Descriptors are persisted in the background
    /// and the uploaded blobs are deleted if that fails.
    pub async fn save_ext_data(
        &self,
        ins: &DagInstance,
        patch: &mut DagInstancePatch,
    ) -> Result<(), ExtDataError> {
        let lock = self
            .save_locks
            .entry(ins.id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock().await;
            self.offload_fields(ins, patch).await
        };
        drop(lock);
        self.save_locks
            .remove_if(&ins.id, |_, m| Arc::strong_count(m) == 1);
        result
    }

    async fn offload_fields(
        &self,
        ins: &DagInstance,
        patch: &mut DagInstancePatch,
    ) -> Result<(), ExtDataError> {
        let limit = self.config.max_inline_size;
        let mut uploaded = Vec::new();

        if let Some(dict) = &patch.share_data {
            let bytes = serde_json::to_vec(dict)?;
            if bytes.len() > limit {
                let ext = self.upload(ins, ExtDataField::ShareData, bytes).await?;
                patch.share_data = Some(HashMap::new());
                patch.share_data_ext = Some(Some(ext.clone()));
                uploaded.push(ext);
            } else {
                patch.share_data_ext = Some(None);
            }
        }

        if let Some(dump) = &patch.dump {
            if dump.len() > limit {
                let ext = match self
                    .upload(ins, ExtDataField::Dump, dump.clone().into_bytes())
                    .await
                {
                    Ok(ext) => ext,
                    Err(e) => {
                        self.discard(uploaded);
                        return Err(e);
                    }
                };
                patch.dump = Some(String::new());
                patch.dump_ext = Some(Some(ext.clone()));
                uploaded.push(ext);
            } else {
                patch.dump_ext = Some(None);
            }
        }

        if !uploaded.is_empty() {
            self.persist_descriptors(uploaded);
        }
        Ok(())
    }

    fn persist_descriptors(&self, uploaded: Vec<ExtData>) {
        let store = self.store.clone();
        let objects = self.objects.clone();
        self.background.spawn("ext_data_persist", async move {
            if let Err(e) = store.insert_ext_data(&uploaded).await {
                delete_blobs(objects.as_ref(), &uploaded).await;
                return Err(e.into());
            }
            Ok(())
        });
    }

    fn discard(&self, uploaded: Vec<ExtData>) {
        if uploaded.is_empty() {
            return;
        }
        let objects = self.objects.clone();
        self.background.spawn("ext_data_discard", async move {
            delete_blobs(objects.as_ref(), &uploaded).await;
            Ok(())
        });
    }

    /// Upload one field. Every attempt allocates a fresh descriptor.
    pub async fn upload(
        &self,
        ins: &DagInstance,
        field: ExtDataField,
        bytes: Vec<u8>,
    ) -> Result<ExtData, ExtDataError> {
        let attempts = self.attempts();
        let mut last_err = ObjectStorageError::Unavailable;
        for attempt in 1..=attempts {
            let mut ext = ExtData::new(ins.dag_id.clone(), ins.id.clone(), field);
            match self.try_upload(&mut ext, &bytes).await {
                Ok(()) => {
                    tracing::debug!(
                        dag_ins_id = %ins.id,
                        field = %field,
                        size = ext.size,
                        "offloaded instance field"
                    );
                    return Ok(ext);
                }
                Err(e) => {
                    tracing::warn!(
                        dag_ins_id = %ins.id,
                        field = %field,
                        attempt,
                        error = %e,
                        "ext data upload failed"
                    );
                    last_err = e;
                    if attempt < attempts {
                        tokio::time::sleep(self.retry_delay()).await;
                    }
                }
            }
        }
        Err(last_err.into())
    }

    async fn try_upload(&self, ext: &mut ExtData, bytes: &[u8]) -> Result<(), ObjectStorageError> {
        let oss_id = self.objects.get_available().await?;
        let key = ext.object_key(&self.config.storage_prefix);
        self.objects.upload(&oss_id, &key, bytes.to_vec()).await?;
        ext.oss_id = oss_id;
        ext.oss_key = key;
        ext.size = bytes.len() as u64;
        Ok(())
    }

    /// Download the blob behind `ext`. A descriptor without a blob yields
    /// `None` without touching storage.
    pub async fn read(&self, ext: &ExtData) -> Result<Option<Vec<u8>>, ExtDataError> {
        if !ext.has_blob() {
            return Ok(None);
        }
        let attempts = self.attempts();
        let mut last_err = ObjectStorageError::Unavailable;
        for attempt in 1..=attempts {
            match self.objects.download(&ext.oss_id, &ext.oss_key).await {
                Ok(bytes) => return Ok(Some(bytes)),
                Err(e) => {
                    tracing::warn!(
                        ext_id = %ext.id,
                        key = %ext.oss_key,
                        attempt,
                        error = %e,
                        "ext data download failed"
                    );
                    last_err = e;
                    if attempt < attempts {
                        tokio::time::sleep(self.retry_delay()).await;
                    }
                }
            }
        }
        Err(last_err.into())
    }

    pub async fn delete(&self, ext: &ExtData) -> Result<(), ExtDataError> {
        if !ext.has_blob() {
            return Ok(());
        }
        self.objects.delete(&ext.oss_id, &ext.oss_key).await?;
        Ok(())
    }

    /// Bring offloaded fields back inline on `ins`.
    pub async fn load_ext_data(&self, ins: &mut DagInstance) -> Result<(), ExtDataError> {
        if let Some(ext) = ins.share_data_ext.clone() {
            if let Some(bytes) = self.read(&ext).await? {
                let dict: HashMap<String, Value> =
                    serde_json::from_slice(&bytes).map_err(|e| ExtDataError::InvalidPayload {
                        field: ExtDataField::ShareData,
                        message: e.to_string(),
                    })?;
                ins.share_data.replace_all(dict);
            }
        }

        if let Some(ext) = ins.dump_ext.clone() {
            if let Some(bytes) = self.read(&ext).await? {
                ins.dump = String::from_utf8(bytes).map_err(|e| ExtDataError::InvalidPayload {
                    field: ExtDataField::Dump,
                    message: e.to_string(),
                })?;
            }
        }
        Ok(())
    }
}

async fn delete_blobs(objects: &dyn ObjectStorage, uploaded: &[ExtData]) {
    for ext in uploaded {
        if let Err(e) = objects.delete(&ext.oss_id, &ext.oss_key).await {
            tracing::warn!(key = %ext.oss_key, error = %e, "failed to delete orphaned blob");
        }
    }
}
