//! Shared key-value store backing the permission cache and the breaker.
//!
//! Every process of the service talks to the same store, so breaker state and
//! cached decisions converge across instances. Mutations that depend on the
//! current value must go through [`SharedCacheStore::atomic_increment`] or
//! [`SharedCacheStore::compare_and_swap`]; callers never read, modify and write
//! back.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;

pub use in_memory::InMemorySharedStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisSharedStore;

/// Shared store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("shared store unavailable: {0}")]
    Unavailable(String),
    #[error("shared store value is corrupt: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait SharedCacheStore: Send + Sync + core::fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Unconditional write. `ttl = None` keeps the key until it is deleted.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Increment an integer counter (missing keys start at 0) and return the
    /// new value.
    async fn atomic_increment(&self, key: &str) -> Result<i64, StoreError>;

    /// Write `new` only if the current value equals `expected` (`None` meaning
    /// "key absent"). Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Returns whether a key was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// All live keys starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}
