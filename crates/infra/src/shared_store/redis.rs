//! Redis-backed shared store (optional `redis` feature).
//!
//! - **Atomic increment**: `INCR`
//! - **Compare-and-swap**: a Lua script, executed atomically by Redis
//! - **TTL**: `SET ... PX`, so expiry is enforced by Redis itself
//! - **Prefix scan**: `SCAN MATCH prefix*` (never `KEYS`)

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tracing::instrument;

use super::{SharedCacheStore, StoreError};

/// ARGV: [1] "1" if a current value is expected, [2] expected value,
/// [3] new value, [4] ttl in ms ("0" = no expiry).
const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if current ~= ARGV[2] then return 0 end
else
  if current then return 0 end
end
if tonumber(ARGV[4]) > 0 then
  redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[4])
else
  redis.call('SET', KEYS[1], ARGV[3])
end
return 1
"#;

#[derive(Clone)]
pub struct RedisSharedStore {
    conn: MultiplexedConnection,
    cas: redis::Script,
}

impl core::fmt::Debug for RedisSharedStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisSharedStore").finish_non_exhaustive()
    }
}

fn unavailable(e: redis::RedisError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn ttl_millis(ttl: Option<Duration>) -> u64 {
    // Sub-millisecond TTLs round up so a TTL is never silently dropped.
    ttl.map(|t| (t.as_millis() as u64).max(1)).unwrap_or(0)
}

/// Escape glob metacharacters so the prefix is matched literally.
fn escape_pattern(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('*');
    out
}

impl RedisSharedStore {
    /// Connect to Redis (e.g. "redis://localhost:6379/0").
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(unavailable)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;

        Ok(Self {
            conn,
            cas: redis::Script::new(CAS_SCRIPT),
        })
    }
}

#[async_trait]
impl SharedCacheStore for RedisSharedStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(unavailable)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(Some(ttl)));
        }
        cmd.query_async::<_, ()>(&mut conn).await.map_err(unavailable)
    }

    async fn atomic_increment(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        conn.incr(key, 1_i64).await.map_err(unavailable)
    }

    #[instrument(skip(self, expected, new), level = "debug")]
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let swapped: i64 = self
            .cas
            .key(key)
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or(""))
            .arg(new)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(swapped == 1)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await.map_err(unavailable)?;
        Ok(removed > 0)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let mut iter: redis::AsyncIter<'_, String> = conn
            .scan_match(escape_pattern(prefix))
            .await
            .map_err(unavailable)?;

        let mut keys = Vec::new();
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_pattern_escapes_glob_characters() {
        assert_eq!(escape_pattern("auth:permission:o:u:"), "auth:permission:o:u:*");
        assert_eq!(escape_pattern("a*b?[c]"), "a\\*b\\?\\[c\\]*");
    }

    #[test]
    fn ttl_never_rounds_down_to_zero() {
        assert_eq!(ttl_millis(None), 0);
        assert_eq!(ttl_millis(Some(Duration::from_micros(10))), 1);
        assert_eq!(ttl_millis(Some(Duration::from_secs(2))), 2000);
    }
}
