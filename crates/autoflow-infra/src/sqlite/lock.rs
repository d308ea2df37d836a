//! SQLite advisory lock implementation.
//!
//! Lets several processes sharing one database file coordinate Boot of the
//! same instance. A row in `advisory_locks` is a held lock; it can be taken
//! over once `expires_at` (unix milliseconds) has passed.

use std::time::Duration;

use autoflow_core::service::lock::{LockError, LockService};
use chrono::Utc;
use futures_util::future::BoxFuture;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `LockService`.
pub struct SqliteLockService {
    pool: DatabasePool,
}

impl SqliteLockService {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn try_lock_inner(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LockError> {
        let now = Utc::now().timestamp_millis();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = now.saturating_add(ttl_ms);

        // The conditional upsert only replaces an expired row or our own.
        let result = sqlx::query(
            r#"INSERT INTO advisory_locks (key, owner, expires_at)
               VALUES (?, ?, ?)
               ON CONFLICT(key) DO UPDATE SET
                   owner = excluded.owner,
                   expires_at = excluded.expires_at
               WHERE advisory_locks.expires_at <= ? OR advisory_locks.owner = excluded.owner"#,
        )
        .bind(key)
        .bind(owner)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| LockError::Unavailable(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn unlock_inner(&self, key: &str, owner: &str) -> Result<(), LockError> {
        sqlx::query("DELETE FROM advisory_locks WHERE key = ? AND owner = ?")
            .bind(key)
            .bind(owner)
            .execute(&self.pool.writer)
            .await
            .map_err(|e| LockError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

impl LockService for SqliteLockService {
    fn try_lock<'a>(
        &'a self,
        key: &'a str,
        owner: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, LockError>> {
        Box::pin(self.try_lock_inner(key, owner, ttl))
    }

    fn unlock<'a>(&'a self, key: &'a str, owner: &'a str) -> BoxFuture<'a, Result<(), LockError>> {
        Box::pin(self.unlock_inner(key, owner))
    }
}
