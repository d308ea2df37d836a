//! ShareData: the per-instance key-value scope visible to every step of a run.
//!
//! Writes go through a key-naming scheme that shadows every user key under a
//! `__`-prefixed storage key, and iteration-scoped keys (`<name>_i<N>_s<origin>`)
//! additionally populate their origin key. The exact rules live in
//! [`storage_keys`] and are relied upon by compiled programs, so they must not
//! drift.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::ShareDataError;

/// Type tag used by the document-store encoding of ShareData.
pub const INTERNAL_TYPE_KEY: &str = "__internal_type";
const INTERNAL_TYPE_OBJECT: &str = "object";

static ITERATION_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_i\d+_s([^_]+)$").expect("iteration key pattern is valid"));

/// Persistence callback invoked after every `set`/`batch_set`, outside the lock.
pub type SaveFn = Arc<dyn Fn(&ShareData) -> Result<(), ShareDataError> + Send + Sync>;

/// Which write path a key is being stored through. The two paths differ for
/// `_i` keys that do not match the iteration pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Single,
    Batch,
}

/// Resolve the storage keys a user key is written under.
fn storage_keys(key: &str, mode: WriteMode) -> Vec<String> {
    if key.is_empty() {
        return Vec::new();
    }
    if key.starts_with("__") {
        return vec![key.to_string()];
    }
    if key.contains("_i") {
        if let Some(caps) = ITERATION_KEY.captures(key) {
            return vec![format!("__{}", &caps[1]), format!("__{key}")];
        }
        let origin = key.rsplit('_').next().unwrap_or(key);
        return match mode {
            WriteMode::Single => vec![format!("__{origin}"), format!("__{key}")],
            WriteMode::Batch => vec![format!("__{origin}")],
        };
    }
    vec![format!("__{key}")]
}

struct Inner {
    dict: RwLock<HashMap<String, Value>>,
    save: RwLock<Option<SaveFn>>,
}

/// Concurrent key-value scope bound to one DagInstance.
///
/// Cloning is cheap and every clone observes the same dict.
#[derive(Clone)]
pub struct ShareData {
    inner: Arc<Inner>,
}

impl Default for ShareData {
    fn default() -> Self {
        Self::from_map(HashMap::new())
    }
}

impl std::fmt::Debug for ShareData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShareData")
            .field("dict", &*self.read())
            .field("has_save", &self.save_fn().is_some())
            .finish()
    }
}

impl ShareData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(dict: HashMap<String, Value>) -> Self {
        Self {
            inner: Arc::new(Inner {
                dict: RwLock::new(dict),
                save: RwLock::new(None),
            }),
        }
    }

    /// Install (or clear) the persistence callback.
    pub fn set_save(&self, save: Option<SaveFn>) {
        let mut slot = self.inner.save.write().unwrap_or_else(|e| e.into_inner());
        *slot = save;
    }

    fn save_fn(&self) -> Option<SaveFn> {
        self.inner
            .save
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Value>> {
        self.inner.dict.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Value>> {
        self.inner.dict.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Read a raw storage key. No naming rules are applied on reads.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.read().get(key).cloned()
    }

    /// Write `value` under the storage keys derived from `key`.
    ///
    /// When the save callback fails, the key is removed exactly as it was
    /// passed in and the error is returned. For plain keys that means the
    /// `__`-prefixed shadow written above survives the rollback.
    pub fn set(&self, key: &str, value: Value) -> Result<(), ShareDataError> {
        let keys = storage_keys(key, WriteMode::Single);
        if keys.is_empty() {
            return Ok(());
        }
        {
            let mut dict = self.write();
            for stored in keys {
                dict.insert(stored, value.clone());
            }
        }

        if let Some(save) = self.save_fn() {
            if let Err(e) = save(self) {
                self.write().remove(key);
                tracing::warn!(key, error = %e, "sharedata save failed, key rolled back");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Read several raw storage keys; absent keys are omitted.
    pub fn batch_get(&self, keys: &[&str]) -> HashMap<String, Value> {
        let dict = self.read();
        keys.iter()
            .filter_map(|k| dict.get(*k).map(|v| (k.to_string(), v.clone())))
            .collect()
    }

    /// Write several keys under one lock acquisition.
    ///
    /// Unlike [`ShareData::set`], `_i` keys that do not match the iteration
    /// pattern only populate their origin key, and a failed save is logged
    /// without any rollback.
    pub fn batch_set(&self, values: HashMap<String, Value>) {
        {
            let mut dict = self.write();
            for (key, value) in values {
                for stored in storage_keys(&key, WriteMode::Batch) {
                    dict.insert(stored, value.clone());
                }
            }
        }

        if let Some(save) = self.save_fn() {
            if let Err(e) = save(self) {
                tracing::warn!(error = %e, "sharedata batch save failed");
            }
        }
    }

    /// Copy of the whole dict.
    pub fn get_all(&self) -> HashMap<String, Value> {
        self.read().clone()
    }

    /// Swap the whole dict in one write-lock acquisition.
    pub fn replace_all(&self, dict: HashMap<String, Value>) {
        *self.write() = dict;
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Encode for the document store: `{"__internal_type": "object", "data": "<json>"}`.
    pub fn to_document(&self) -> Result<Value, ShareDataError> {
        let data = serde_json::to_string(&*self.read())?;
        Ok(serde_json::json!({
            INTERNAL_TYPE_KEY: INTERNAL_TYPE_OBJECT,
            "data": data,
        }))
    }

    /// Decode a document-store value. Accepts the wrapped form and the
    /// legacy bare dict. A wrapped value without `data` is an empty dict.
    pub fn from_document(doc: Value) -> Result<Self, ShareDataError> {
        let Value::Object(mut obj) = doc else {
            return Err(ShareDataError::Invalid);
        };
        match obj.remove(INTERNAL_TYPE_KEY) {
            None => Ok(Self::from_map(obj.into_iter().collect())),
            Some(Value::String(t)) if t == INTERNAL_TYPE_OBJECT => {
                match obj.remove("data") {
                    None | Some(Value::Null) => Ok(Self::default()),
                    Some(Value::String(data)) => {
                        let dict: HashMap<String, Value> = serde_json::from_str(&data)?;
                        Ok(Self::from_map(dict))
                    }
                    Some(_) => Err(ShareDataError::Invalid),
                }
            }
            Some(_) => Err(ShareDataError::Invalid),
        }
    }
}

impl Serialize for ShareData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.read().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ShareData {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let dict = Option::<HashMap<String, Value>>::deserialize(deserializer)?;
        Ok(Self::from_map(dict.unwrap_or_default()))
    }
}

/// In-process ShareData sibling without persistence.
///
/// Shares the single-key naming rules of [`ShareData::set`].
#[derive(Debug, Default)]
pub struct MemoryShareData {
    dict: RwLock<HashMap<String, Value>>,
}

impl MemoryShareData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.dict
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn set(&self, key: &str, value: Value) {
        let mut dict = self.dict.write().unwrap_or_else(|e| e.into_inner());
        for stored in storage_keys(key, WriteMode::Single) {
            dict.insert(stored, value.clone());
        }
    }
}
