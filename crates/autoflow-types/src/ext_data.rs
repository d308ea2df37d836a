//! Descriptors of DagInstance fields offloaded to object storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which DagInstance field a blob holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExtDataField {
    #[serde(rename = "shareData")]
    ShareData,
    #[serde(rename = "dump")]
    Dump,
}

impl ExtDataField {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtDataField::ShareData => "shareData",
            ExtDataField::Dump => "dump",
        }
    }
}

impl std::fmt::Display for ExtDataField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pointer from a DagInstance to an externally stored blob.
///
/// An empty `oss_id` or `oss_key` means nothing was uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtData {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub dag_id: String,
    pub dag_ins_id: String,
    pub field: ExtDataField,
    #[serde(default)]
    pub oss_id: String,
    #[serde(default)]
    pub oss_key: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub removed: bool,
}

impl ExtData {
    pub fn new(dag_id: impl Into<String>, dag_ins_id: impl Into<String>, field: ExtDataField) -> Self {
        let now = Utc::now();
        Self {
            id: crate::new_id(),
            created_at: now,
            updated_at: now,
            dag_id: dag_id.into(),
            dag_ins_id: dag_ins_id.into(),
            field,
            oss_id: String::new(),
            oss_key: String::new(),
            size: 0,
            removed: false,
        }
    }

    /// Object key: `<prefix>/dag_instance/<dagInsID>/<field>_<descriptorID>`.
    pub fn object_key(&self, storage_prefix: &str) -> String {
        format!(
            "{storage_prefix}/dag_instance/{}/{}_{}",
            self.dag_ins_id, self.field, self.id
        )
    }

    pub fn has_blob(&self) -> bool {
        !self.oss_id.is_empty() && !self.oss_key.is_empty()
    }
}
