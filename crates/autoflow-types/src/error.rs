use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from repository operations (used by trait definitions in autoflow-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors raised by Dag and DagInstance state transitions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DagError {
    #[error("you cannot run a stopeed dag")]
    Stopped,

    #[error("you can only cancel a running dag instance")]
    NotRunning,

    #[error("dag instance have a incomplete command")]
    IncompleteCommand,
}

/// Errors related to ShareData persistence and decoding.
#[derive(Debug, Error)]
pub enum ShareDataError {
    #[error("invalid sharedata")]
    Invalid,

    #[error("sharedata save failed: {0}")]
    Save(String),

    #[error("sharedata serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Public error codes surfaced outside the engine (webhooks, boot results).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublicErrorCode {
    #[serde(rename = "Public.NotFound")]
    NotFound,
    #[serde(rename = "Public.InternalServerError")]
    InternalServerError,
}

impl PublicErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublicErrorCode::NotFound => "Public.NotFound",
            PublicErrorCode::InternalServerError => "Public.InternalServerError",
        }
    }
}

impl std::fmt::Display for PublicErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error shape reported to end users.
///
/// The underlying cause is only ever logged; `detail` carries the small,
/// structured context a caller may act on (for example `{"dagId": "..."}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{code}: {description}")]
pub struct PublicError {
    pub code: PublicErrorCode,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl PublicError {
    pub fn not_found(detail: serde_json::Value) -> Self {
        Self {
            code: PublicErrorCode::NotFound,
            description: "resource not found".to_string(),
            detail: Some(detail),
        }
    }

    pub fn internal(detail: Option<serde_json::Value>) -> Self {
        Self {
            code: PublicErrorCode::InternalServerError,
            description: "internal server error".to_string(),
            detail,
        }
    }
}
