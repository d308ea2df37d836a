//! Advisory, TTL-bounded locking.
//!
//! [`LockService`] is the port; [`LockGuard`] scopes one acquisition so the
//! lock is released on every exit path, and [`InProcessLockService`] is the
//! single-process implementation backed by a `DashMap`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::future::BoxFuture;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock service unavailable: {0}")]
    Unavailable(String),
}

/// Best-effort mutual exclusion keyed by string.
///
/// Failing to acquire is reported as `Ok(false)`, not as an error: it means
/// somebody else currently owns the key.
pub trait LockService: Send + Sync {
    fn try_lock<'a>(
        &'a self,
        key: &'a str,
        owner: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, LockError>>;

    /// Release `key` if it is still held by `owner`.
    fn unlock<'a>(&'a self, key: &'a str, owner: &'a str) -> BoxFuture<'a, Result<(), LockError>>;
}

/// One held lock. Call [`LockGuard::release`] when done; dropping an
/// unreleased guard schedules the unlock on the current runtime instead.
pub struct LockGuard {
    service: Arc<dyn LockService>,
    key: String,
    owner: String,
    released: bool,
}

impl LockGuard {
    /// Try to take `key` for `ttl`. `Ok(None)` means it is held elsewhere.
    pub async fn acquire(
        service: Arc<dyn LockService>,
        key: impl Into<String>,
        ttl: Duration,
    ) -> Result<Option<Self>, LockError> {
        let key = key.into();
        let owner = uuid::Uuid::now_v7().to_string();
        if !service.try_lock(&key, &owner, ttl).await? {
            return Ok(None);
        }
        tracing::debug!(key = %key, owner = %owner, "advisory lock acquired");
        Ok(Some(Self {
            service,
            key,
            owner,
            released: false,
        }))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn release(mut self) {
        self.released = true;
        match self.service.unlock(&self.key, &self.owner).await {
            Ok(()) => tracing::debug!(key = %self.key, "advisory lock released"),
            Err(e) => tracing::warn!(key = %self.key, error = %e, "failed to release advisory lock"),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let service = self.service.clone();
        let key = std::mem::take(&mut self.key);
        let owner = std::mem::take(&mut self.owner);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = service.unlock(&key, &owner).await {
                        tracing::warn!(key = %key, error = %e, "failed to release dropped lock");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(key = %key, "lock guard dropped outside a runtime; lock expires by TTL");
            }
        }
    }
}

struct Held {
    owner: String,
    expires_at: Instant,
}

/// Lock service for a single process.
#[derive(Default)]
pub struct InProcessLockService {
    held: DashMap<String, Held>,
}

impl InProcessLockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` is currently held by anyone.
    pub fn is_held(&self, key: &str) -> bool {
        self.held
            .get(key)
            .is_some_and(|h| h.expires_at > Instant::now())
    }

    fn try_lock_sync(&self, key: &str, owner: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let held = Held {
            owner: owner.to_string(),
            expires_at: now + ttl,
        };
        match self.held.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                if e.get().expires_at <= now || e.get().owner == owner {
                    e.insert(held);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(e) => {
                e.insert(held);
                true
            }
        }
    }
}

impl LockService for InProcessLockService {
    fn try_lock<'a>(
        &'a self,
        key: &'a str,
        owner: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, LockError>> {
        let acquired = self.try_lock_sync(key, owner, ttl);
        Box::pin(async move { Ok(acquired) })
    }

    fn unlock<'a>(&'a self, key: &'a str, owner: &'a str) -> BoxFuture<'a, Result<(), LockError>> {
        self.held.remove_if(key, |_, held| held.owner == owner);
        Box::pin(async { Ok(()) })
    }
}
