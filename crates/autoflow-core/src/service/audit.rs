//! Audit sink port and a tracing-backed default.

use autoflow_types::audit::AuditEntry;
use futures_util::future::BoxFuture;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit write failed: {0}")]
    Write(String),
}

/// Destination of run start/end audit entries. Writes are best-effort.
pub trait AuditSink: Send + Sync {
    fn log(&self, entry: AuditEntry) -> BoxFuture<'_, Result<(), AuditError>>;
}

/// Emits audit entries as structured `tracing` events.
#[derive(Debug, Default)]
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn log(&self, entry: AuditEntry) -> BoxFuture<'_, Result<(), AuditError>> {
        Box::pin(async move {
            let object = serde_json::Value::Object(entry.object);
            tracing::info!(
                target: "autoflow::audit",
                operation = entry.operation.as_str(),
                user_id = %entry.user.id,
                user_type = %entry.user.user_type,
                object = %object,
                "{}",
                entry.description
            );
            Ok(())
        })
    }
}
