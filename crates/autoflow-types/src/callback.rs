//! Payload of the success/error webhooks fired when a run stops.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PublicError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AsyncStatus {
    Completed,
    Failed,
}

/// Body POSTed to a run's success or error callback URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncResponse {
    pub task_id: String,
    pub status: AsyncStatus,
    /// RFC3339 send time.
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl AsyncResponse {
    pub fn completed(task_id: impl Into<String>, data: Value) -> Self {
        Self {
            task_id: task_id.into(),
            status: AsyncStatus::Completed,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(task_id: impl Into<String>, error: &PublicError) -> Self {
        Self {
            task_id: task_id.into(),
            status: AsyncStatus::Failed,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            data: None,
            error: serde_json::to_value(error).ok(),
        }
    }
}
