use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::Result;

/// Atomic set-if-absent-with-expiry store used for entity-scoped mutual exclusion.
///
/// A key that has outlived its TTL counts as absent. Holders are not
/// fenced: if a run outlasts the TTL another writer can take the key.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Sets `key` to `value` if it is absent or expired. Returns true if the lock was taken.
    async fn set_if_absent_with_expiry(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool>;

    /// Removes `key`. Returns true if a live entry was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Liveness check.
    async fn ping(&self) -> Result<()>;
}

#[derive(Debug)]
struct LockEntry {
    value: String,
    expires_at: Instant,
}

/// In-memory lock store for testing and single-process deployments.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLockStore {
    entries: Arc<Mutex<HashMap<String, LockEntry>>>,
}

impl InMemoryLockStore {
    /// Creates a new empty lock store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `key` is currently held.
    pub async fn is_locked(&self, key: &str) -> bool {
        let entries = self.entries.lock().await;
        entries
            .get(key)
            .is_some_and(|entry| entry.expires_at > Instant::now())
    }

    /// Returns the value stored under a live `key`.
    pub async fn holder(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().await;
        entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value.clone())
    }

    /// Returns the number of live locks.
    pub async fn active_count(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        entries.values().filter(|e| e.expires_at > now).count()
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn set_if_absent_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        if let Some(existing) = entries.get(key)
            && existing.expires_at > now
        {
            return Ok(false);
        }

        entries.insert(
            key.to_string(),
            LockEntry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        Ok(entries
            .remove(key)
            .is_some_and(|entry| entry.expires_at > Instant::now()))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_is_rejected() {
        let store = InMemoryLockStore::new();
        let ttl = Duration::from_secs(60);

        assert!(store.set_if_absent_with_expiry("entity:42", "a", ttl).await.unwrap());
        assert!(!store.set_if_absent_with_expiry("entity:42", "b", ttl).await.unwrap());
        assert_eq!(store.holder("entity:42").await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn delete_frees_the_key() {
        let store = InMemoryLockStore::new();
        let ttl = Duration::from_secs(60);

        store.set_if_absent_with_expiry("k", "a", ttl).await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.is_locked("k").await);
        assert!(store.set_if_absent_with_expiry("k", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn delete_missing_key_returns_false() {
        let store = InMemoryLockStore::new();
        assert!(!store.delete("missing").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lock_can_be_taken() {
        let store = InMemoryLockStore::new();

        store
            .set_if_absent_with_expiry("k", "a", Duration::from_millis(100))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(150)).await;

        assert!(!store.is_locked("k").await);
        assert!(
            store
                .set_if_absent_with_expiry("k", "b", Duration::from_secs(1))
                .await
                .unwrap()
        );
        assert_eq!(store.active_count().await, 1);
    }
}
