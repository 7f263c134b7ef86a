//! Distributed lock contract and an in-process implementation.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::StorageError;

/// Mutual exclusion across engine replicas.
///
/// Keys are plain strings. Patterns passed to [`Locker::reset`] may end in
/// `*` to match every key with that prefix.
#[async_trait]
pub trait Locker: Send + Sync {
    /// Take the lock if free. Returns `false` when someone else holds it.
    async fn try_lock(&self, key: &str) -> Result<bool, StorageError>;

    async fn unlock(&self, key: &str) -> Result<(), StorageError>;

    /// Release every lock matching `pattern`. Returns how many were released.
    async fn reset(&self, pattern: &str) -> Result<usize, StorageError>;
}

#[async_trait]
impl<T: Locker + ?Sized> Locker for Arc<T> {
    async fn try_lock(&self, key: &str) -> Result<bool, StorageError> {
        (**self).try_lock(key).await
    }

    async fn unlock(&self, key: &str) -> Result<(), StorageError> {
        (**self).unlock(key).await
    }

    async fn reset(&self, pattern: &str) -> Result<usize, StorageError> {
        (**self).reset(pattern).await
    }
}

/// Whether `key` matches a `reset` pattern.
pub fn key_matches(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

/// Locks held in this process only. Enough for a single replica.
#[derive(Debug, Default)]
pub struct MemoryLocker {
    held: Mutex<HashSet<String>>,
}

impl MemoryLocker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_held(&self, key: &str) -> bool {
        self.held.lock().await.contains(key)
    }
}

#[async_trait]
impl Locker for MemoryLocker {
    async fn try_lock(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.held.lock().await.insert(key.to_string()))
    }

    async fn unlock(&self, key: &str) -> Result<(), StorageError> {
        self.held.lock().await.remove(key);
        Ok(())
    }

    async fn reset(&self, pattern: &str) -> Result<usize, StorageError> {
        let mut held = self.held.lock().await;
        let before = held.len();
        held.retain(|key| !key_matches(pattern, key));
        let released = before - held.len();
        if released > 0 {
            info!(pattern, released, "released stale locks");
        }
        Ok(released)
    }
}
