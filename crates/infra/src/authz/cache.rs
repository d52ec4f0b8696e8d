//! Cache-aside store of permission decisions.
//!
//! Key: `auth:permission:{org}:{user}:{permission}` → `{"allowed":..,"expires_at":..}`.
//! Every write carries a TTL chosen from [`DecisionTtls`]; nothing is stored
//! without one.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use imagegate_auth::{DecisionTtls, Permission, PermissionClass, PermissionDecision};
use imagegate_core::{Clock, OrgId, SystemClock, UserId};

use crate::shared_store::{SharedCacheStore, StoreError};

const KEY_PREFIX: &str = "auth:permission";

/// Cache key for one decision.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DecisionKey {
    pub org_id: OrgId,
    pub user_id: UserId,
    pub permission: Permission,
}

impl DecisionKey {
    pub fn new(org_id: OrgId, user_id: UserId, permission: Permission) -> Self {
        Self {
            org_id,
            user_id,
            permission,
        }
    }

    fn storage_key(&self) -> String {
        format!("{}{}", subject_prefix(&self.org_id, &self.user_id), self.permission)
    }
}

fn subject_prefix(org_id: &OrgId, user_id: &UserId) -> String {
    format!("{KEY_PREFIX}:{org_id}:{user_id}:")
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredDecision {
    allowed: bool,
    expires_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct PermissionCache {
    store: Arc<dyn SharedCacheStore>,
    ttls: DecisionTtls,
    enabled: bool,
    clock: Arc<dyn Clock>,
}

impl PermissionCache {
    pub fn new(store: Arc<dyn SharedCacheStore>, ttls: DecisionTtls) -> Self {
        Self {
            store,
            ttls,
            enabled: true,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Disabled caches always miss and never write.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn ttls(&self) -> &DecisionTtls {
        &self.ttls
    }

    /// Look up a decision. Entries past their `expires_at` are misses even if
    /// the store has not evicted them yet.
    pub async fn get(&self, key: &DecisionKey) -> Result<Option<PermissionDecision>, StoreError> {
        if !self.enabled {
            return Ok(None);
        }

        let Some(raw) = self.store.get(&key.storage_key()).await? else {
            return Ok(None);
        };

        let stored: StoredDecision =
            serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt(e.to_string()))?;

        if stored.expires_at <= self.clock.now() {
            return Ok(None);
        }

        debug!(
            org_id = %key.org_id,
            user_id = %key.user_id,
            permission = %key.permission,
            allowed = stored.allowed,
            "auth cache hit"
        );

        Ok(Some(PermissionDecision::cached(stored.allowed, stored.expires_at)))
    }

    /// Store a decision with the TTL for its class (or the denied TTL).
    /// Returns the expiry written, `None` when the cache is disabled.
    pub async fn set(
        &self,
        key: &DecisionKey,
        allowed: bool,
        class: PermissionClass,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        if !self.enabled {
            return Ok(None);
        }

        let ttl = self.ttls.for_outcome(class, allowed);
        let ttl_delta = chrono::Duration::from_std(ttl)
            .map_err(|e| StoreError::Corrupt(format!("ttl out of range: {e}")))?;
        let expires_at = self.clock.now() + ttl_delta;

        let value = serde_json::to_string(&StoredDecision { allowed, expires_at })
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        self.store.set(&key.storage_key(), &value, Some(ttl)).await?;

        debug!(
            org_id = %key.org_id,
            user_id = %key.user_id,
            permission = %key.permission,
            allowed,
            ttl_secs = ttl.as_secs(),
            "auth cache stored"
        );

        Ok(Some(expires_at))
    }

    /// Remove every cached decision for a subject (e.g. after a group
    /// membership change). Returns the number of entries removed.
    pub async fn invalidate(&self, org_id: &OrgId, user_id: &UserId) -> Result<usize, StoreError> {
        let keys = self.store.scan_prefix(&subject_prefix(org_id, user_id)).await?;

        let mut removed = 0;
        for key in &keys {
            if self.store.delete(key).await? {
                removed += 1;
            }
        }

        info!(%org_id, %user_id, keys_deleted = removed, "auth cache invalidated");
        Ok(removed)
    }
}
