//! In-memory shared store for tests/dev (single process only).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use imagegate_core::{Clock, SystemClock};

use super::{SharedCacheStore, StoreError};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Hash map behind a lock; every operation is one critical section, which is
/// what makes increment and compare-and-swap atomic here.
#[derive(Debug)]
pub struct InMemorySharedStore {
    entries: RwLock<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl InMemorySharedStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        before - entries.len()
    }

    /// Number of stored entries, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining lifetime of a key, `None` if absent or without expiry.
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        let entries = self.read();
        let at = entries.get(key).filter(|e| e.is_live(now))?.expires_at?;
        (at - now).to_std().ok()
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        let ttl = chrono::Duration::from_std(ttl?).ok()?;
        self.clock.now().checked_add_signed(ttl)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Entry>> {
        self.entries.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Entry>> {
        self.entries.write().unwrap_or_else(|p| p.into_inner())
    }
}

impl Default for InMemorySharedStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedCacheStore for InMemorySharedStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now();
        let mut entries = self.write();
        match entries.get(key) {
            Some(e) if e.is_live(now) => Ok(Some(e.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at = self.expiry(ttl);
        self.write().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn atomic_increment(&self, key: &str) -> Result<i64, StoreError> {
        let now = self.clock.now();
        let mut entries = self.write();
        let (current, expires_at) = match entries.get(key) {
            Some(e) if e.is_live(now) => {
                let n = e
                    .value
                    .parse::<i64>()
                    .map_err(|_| StoreError::Corrupt(format!("{key} is not an integer")))?;
                (n, e.expires_at)
            }
            _ => (0, None),
        };

        let next = current + 1;
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let expires_at = self.expiry(ttl);
        let mut entries = self.write();

        let current = entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.as_str());
        if current != expected {
            return Ok(false);
        }

        entries.insert(
            key.to_string(),
            Entry {
                value: new.to_string(),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        Ok(self.write().remove(key).is_some_and(|e| e.is_live(now)))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let now = self.clock.now();
        let mut keys: Vec<String> = self
            .read()
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.is_live(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imagegate_core::ManualClock;

    fn store() -> (InMemorySharedStore, ManualClock) {
        let clock = ManualClock::starting_now();
        (InMemorySharedStore::with_clock(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let (store, clock) = store();
        store.set("k", "v", Some(Duration::from_secs(10))).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        clock.advance(Duration::from_secs(10));
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn compare_and_swap_checks_current_value() {
        let (store, _) = store();
        assert!(store.compare_and_swap("k", None, "a", None).await.unwrap());
        assert!(!store.compare_and_swap("k", None, "b", None).await.unwrap());
        assert!(!store.compare_and_swap("k", Some("x"), "b", None).await.unwrap());
        assert!(store.compare_and_swap("k", Some("a"), "b", None).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn concurrent_increments_are_not_lost() {
        let store = Arc::new(InMemorySharedStore::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    store.atomic_increment("counter").await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.get("counter").await.unwrap().as_deref(), Some("800"));
    }

    #[tokio::test]
    async fn scan_prefix_skips_expired_and_foreign_keys() {
        let (store, clock) = store();
        store.set("auth:a:1", "x", Some(Duration::from_secs(5))).await.unwrap();
        store.set("auth:a:2", "x", Some(Duration::from_secs(50))).await.unwrap();
        store.set("auth:b:1", "x", None).await.unwrap();

        clock.advance(Duration::from_secs(6));
        assert_eq!(store.scan_prefix("auth:a:").await.unwrap(), vec!["auth:a:2".to_string()]);
        assert_eq!(store.purge_expired(), 1);
    }
}
