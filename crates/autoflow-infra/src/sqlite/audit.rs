//! SQLite run audit log implementation.
//!
//! Persists the start/end entries emitted by the engine and lists them back
//! for the CLI.

use autoflow_core::service::audit::{AuditError, AuditSink};
use autoflow_types::audit::{AuditEntry, AuditOperation, AuditUser};
use autoflow_types::error::RepositoryError;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use sqlx::Row;

use super::pool::DatabasePool;

/// SQLite-backed audit sink.
pub struct SqliteAuditSink {
    pool: DatabasePool,
}

impl SqliteAuditSink {
    /// Create a new audit sink backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Record one audit entry.
    pub async fn insert(&self, entry: &AuditEntry) -> Result<(), RepositoryError> {
        let object = serde_json::Value::Object(entry.object.clone()).to_string();

        sqlx::query(
            r#"INSERT INTO audit_log (id, operation, description, user_id, user_name, user_type, object, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&entry.id)
        .bind(entry.operation.as_str())
        .bind(&entry.description)
        .bind(&entry.user.id)
        .bind(&entry.user.name)
        .bind(&entry.user.user_type)
        .bind(&object)
        .bind(format_datetime(&entry.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    /// Most recent entries first.
    pub async fn list_recent(&self, limit: u32) -> Result<Vec<AuditEntry>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM audit_log ORDER BY created_at DESC, rowid DESC LIMIT ?")
            .bind(i64::from(limit))
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows_to_entries(&rows)
    }
}

impl AuditSink for SqliteAuditSink {
    fn log(&self, entry: AuditEntry) -> BoxFuture<'_, Result<(), AuditError>> {
        Box::pin(async move {
            self.insert(&entry)
                .await
                .map_err(|e| AuditError::Write(e.to_string()))
        })
    }
}

// ---------------------------------------------------------------------------
// Private Row types
// ---------------------------------------------------------------------------

struct AuditRow {
    id: String,
    operation: String,
    description: String,
    user_id: String,
    user_name: String,
    user_type: String,
    object: String,
    created_at: String,
}

impl AuditRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            operation: row.try_get("operation")?,
            description: row.try_get("description")?,
            user_id: row.try_get("user_id")?,
            user_name: row.try_get("user_name")?,
            user_type: row.try_get("user_type")?,
            object: row.try_get("object")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_entry(self) -> Result<AuditEntry, RepositoryError> {
        let operation = match self.operation.as_str() {
            "start" => AuditOperation::Start,
            "end" => AuditOperation::End,
            other => {
                return Err(RepositoryError::Query(format!(
                    "invalid audit operation: '{other}'"
                )));
            }
        };
        let object = match serde_json::from_str(&self.object) {
            Ok(serde_json::Value::Object(map)) => map,
            Ok(_) => return Err(RepositoryError::Query("audit object is not a map".to_string())),
            Err(e) => return Err(RepositoryError::Query(format!("invalid audit object: {e}"))),
        };

        Ok(AuditEntry {
            id: self.id,
            operation,
            description: self.description,
            user: AuditUser {
                id: self.user_id,
                name: self.user_name,
                user_type: self.user_type,
            },
            object,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn rows_to_entries(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<AuditEntry>, RepositoryError> {
    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let audit_row =
            AuditRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
        entries.push(audit_row.into_entry()?);
    }
    Ok(entries)
}
