//! Single entry point for permission decisions.
//!
//! Flow:
//! 1. Cache hit → answer from cache
//! 2. Otherwise ask the authority through the breaker-guarded client
//! 3. Authority answer → cache it under the permission's class
//! 4. Breaker open / authority failure → [`FailPolicy`], never cached
//!
//! A cache store fault is a miss, not an error.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use imagegate_auth::{AuthzError, FailPolicy, Permission, PermissionDecision, enforce};
use imagegate_core::{OrgId, UserId};

use crate::shared_store::StoreError;

use super::authority::AuthorityError;
use super::breaker::CircuitSnapshot;
use super::cache::{DecisionKey, PermissionCache};
use super::client::AuthorityClient;

/// Audit log target for authorization decisions.
pub const AUDIT_TARGET: &str = "audit";

#[derive(Debug, Clone)]
pub struct AuthorizationService {
    cache: Arc<PermissionCache>,
    client: AuthorityClient,
    fail_policy: FailPolicy,
}

impl AuthorizationService {
    pub fn new(cache: Arc<PermissionCache>, client: AuthorityClient, fail_policy: FailPolicy) -> Self {
        Self {
            cache,
            client,
            fail_policy,
        }
    }

    pub fn fail_policy(&self) -> FailPolicy {
        self.fail_policy
    }

    /// Decide whether `user_id` in `org_id` holds `permission`.
    ///
    /// Always produces a decision; unavailability is folded into the fail
    /// policy. Every decision is written to the audit log.
    pub async fn check(&self, org_id: &OrgId, user_id: &UserId, permission: &Permission) -> PermissionDecision {
        let started = Instant::now();
        let key = DecisionKey::new(org_id.clone(), user_id.clone(), permission.clone());

        let decision = match self.cache.get(&key).await {
            Ok(Some(hit)) => hit,
            Ok(None) => {
                debug!(%org_id, %user_id, %permission, "auth cache miss");
                self.resolve(&key).await
            }
            Err(e) => {
                warn!(%org_id, %user_id, %permission, error = %e, "auth cache read failed; treating as miss");
                self.resolve(&key).await
            }
        };

        info!(
            target: AUDIT_TARGET,
            %org_id,
            %user_id,
            %permission,
            allowed = decision.allowed,
            source = %decision.source,
            latency_ms = started.elapsed().as_secs_f64() * 1000.0,
            "authorization decision"
        );

        decision
    }

    /// [`Self::check`], turned into a gate: denials become [`AuthzError`].
    pub async fn require(
        &self,
        org_id: &OrgId,
        user_id: &UserId,
        permission: &Permission,
    ) -> Result<PermissionDecision, AuthzError> {
        let decision = self.check(org_id, user_id, permission).await;
        enforce(permission, decision)
    }

    /// Drop every cached decision for a subject.
    pub async fn invalidate_subject(&self, org_id: &OrgId, user_id: &UserId) -> Result<usize, StoreError> {
        self.cache.invalidate(org_id, user_id).await
    }

    pub async fn breaker_status(&self) -> Result<CircuitSnapshot, StoreError> {
        self.client.breaker().status().await
    }

    async fn resolve(&self, key: &DecisionKey) -> PermissionDecision {
        match self.client.check(&key.org_id, &key.user_id, &key.permission).await {
            Ok(verdict) => {
                let expires_at = match self.cache.set(key, verdict.allowed, key.permission.class()).await {
                    Ok(expires_at) => expires_at,
                    Err(e) => {
                        warn!(
                            org_id = %key.org_id,
                            user_id = %key.user_id,
                            permission = %key.permission,
                            error = %e,
                            "auth cache write failed"
                        );
                        None
                    }
                };
                PermissionDecision::from_authority(verdict.allowed, expires_at)
            }
            Err(e) => self.apply_fail_policy(key, &e),
        }
    }

    fn apply_fail_policy(&self, key: &DecisionKey, cause: &AuthorityError) -> PermissionDecision {
        match self.fail_policy {
            FailPolicy::FailOpen => warn!(
                org_id = %key.org_id,
                user_id = %key.user_id,
                permission = %key.permission,
                reason = %cause,
                "authorization fail-open"
            ),
            FailPolicy::FailClosed => warn!(
                org_id = %key.org_id,
                user_id = %key.user_id,
                permission = %key.permission,
                reason = %cause,
                "authorization fail-closed"
            ),
        }
        self.fail_policy.decide()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::authz::breaker::{BreakerConfig, CircuitBreaker, CircuitState};
    use crate::shared_store::{InMemorySharedStore, SharedCacheStore};
    use crate::testing::{ScriptedAuthority, UnavailableStore};
    use imagegate_auth::{DecisionSource, DecisionTtls};
    use imagegate_core::ManualClock;

    struct Harness {
        service: AuthorizationService,
        authority: Arc<ScriptedAuthority>,
        clock: ManualClock,
    }

    fn harness_with(
        authority: ScriptedAuthority,
        store: Arc<dyn SharedCacheStore>,
        clock: ManualClock,
        policy: FailPolicy,
        threshold: u32,
    ) -> Harness {
        let authority = Arc::new(authority);
        let ttls = DecisionTtls {
            denied: Duration::from_secs(20),
            ..Default::default()
        };
        let cache = PermissionCache::new(store.clone(), ttls).with_clock(Arc::new(clock.clone()));
        let breaker = CircuitBreaker::new(
            "authority",
            store,
            BreakerConfig {
                threshold,
                timeout: Duration::from_secs(30),
                ..Default::default()
            },
        )
        .with_clock(Arc::new(clock.clone()));
        let client = AuthorityClient::new(authority.clone(), Arc::new(breaker), Duration::from_secs(2));

        Harness {
            service: AuthorizationService::new(Arc::new(cache), client, policy),
            authority,
            clock,
        }
    }

    fn harness(authority: ScriptedAuthority, policy: FailPolicy) -> Harness {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemorySharedStore::with_clock(Arc::new(clock.clone())));
        harness_with(authority, store, clock, policy, 5)
    }

    fn ids() -> (OrgId, UserId) {
        (OrgId::new("org-1").unwrap(), UserId::new("user-1").unwrap())
    }

    #[tokio::test]
    async fn authority_answer_is_cached_and_reused() {
        let h = harness(ScriptedAuthority::always_allow(), FailPolicy::FailClosed);
        let (org, user) = ids();

        let first = h.service.check(&org, &user, &Permission::IMAGE_UPLOAD).await;
        assert!(first.allowed);
        assert_eq!(first.source, DecisionSource::Authority);
        assert!(first.expires_at.is_some());

        let second = h.service.check(&org, &user, &Permission::IMAGE_UPLOAD).await;
        assert!(second.allowed);
        assert_eq!(second.source, DecisionSource::Cache);
        assert_eq!(h.authority.calls(), 1);
    }

    #[tokio::test]
    async fn cached_allow_within_ttl_never_calls_authority() {
        let h = harness(ScriptedAuthority::always_allow(), FailPolicy::FailClosed);
        let (org, user) = ids();

        h.service.check(&org, &user, &Permission::IMAGE_READ).await;
        for _ in 0..10 {
            h.clock.advance(Duration::from_secs(29));
            let d = h.service.check(&org, &user, &Permission::IMAGE_READ).await;
            assert_eq!(d.source, DecisionSource::Cache);
        }
        assert_eq!(h.authority.calls(), 1);
    }

    #[tokio::test]
    async fn denial_expires_on_its_own_ttl_then_requeries() {
        let h = harness(ScriptedAuthority::always_deny(), FailPolicy::FailClosed);
        let (org, user) = ids();

        let d = h.service.check(&org, &user, &Permission::IMAGE_READ).await;
        assert!(!d.allowed);
        assert_eq!(d.source, DecisionSource::Authority);

        h.clock.advance(Duration::from_secs(19));
        assert_eq!(h.service.check(&org, &user, &Permission::IMAGE_READ).await.source, DecisionSource::Cache);
        assert_eq!(h.authority.calls(), 1);

        h.clock.advance(Duration::from_secs(1));
        assert_eq!(h.service.check(&org, &user, &Permission::IMAGE_READ).await.source, DecisionSource::Authority);
        assert_eq!(h.authority.calls(), 2);
    }

    #[tokio::test]
    async fn failures_open_breaker_then_policy_answers_without_calls() {
        let h = harness(ScriptedAuthority::always_fail(), FailPolicy::FailClosed);
        let (org, user) = ids();

        for _ in 0..5 {
            let d = h.service.check(&org, &user, &Permission::IMAGE_UPLOAD).await;
            assert_eq!(d.source, DecisionSource::FailClosed);
        }
        assert_eq!(h.authority.calls(), 5);
        assert_eq!(h.service.breaker_status().await.unwrap().state, CircuitState::Open);

        let sixth = h.service.check(&org, &user, &Permission::IMAGE_UPLOAD).await;
        assert!(!sixth.allowed);
        assert_eq!(sixth.source, DecisionSource::FailClosed);
        assert_eq!(h.authority.calls(), 5);
    }

    #[tokio::test]
    async fn fail_open_allows_and_does_not_cache() {
        let h = harness(ScriptedAuthority::always_fail(), FailPolicy::FailOpen);
        let (org, user) = ids();

        let d = h.service.check(&org, &user, &Permission::IMAGE_UPLOAD).await;
        assert!(d.allowed);
        assert_eq!(d.source, DecisionSource::FailOpen);

        let again = h.service.check(&org, &user, &Permission::IMAGE_UPLOAD).await;
        assert_eq!(again.source, DecisionSource::FailOpen);
        assert_eq!(h.authority.calls(), 2);
    }

    #[tokio::test]
    async fn recovers_through_half_open_trial() {
        let authority = ScriptedAuthority::script([Err(()), Ok(true)]);
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemorySharedStore::with_clock(Arc::new(clock.clone())));
        let h = harness_with(authority, store, clock, FailPolicy::FailClosed, 1);
        let (org, user) = ids();

        assert_eq!(h.service.check(&org, &user, &Permission::IMAGE_UPLOAD).await.source, DecisionSource::FailClosed);
        h.clock.advance(Duration::from_secs(30));

        let d = h.service.check(&org, &user, &Permission::IMAGE_UPLOAD).await;
        assert_eq!(d.source, DecisionSource::Authority);
        assert!(d.allowed);
        assert_eq!(h.service.breaker_status().await.unwrap().state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn unreachable_cache_store_falls_through_to_authority() {
        let h = harness_with(
            ScriptedAuthority::always_allow(),
            Arc::new(UnavailableStore),
            ManualClock::starting_now(),
            FailPolicy::FailClosed,
            5,
        );
        let (org, user) = ids();

        let d = h.service.check(&org, &user, &Permission::IMAGE_UPLOAD).await;
        assert!(d.allowed);
        assert_eq!(d.source, DecisionSource::Authority);
        assert_eq!(d.expires_at, None);
    }

    #[tokio::test]
    async fn require_maps_denials() {
        let h = harness(ScriptedAuthority::always_deny(), FailPolicy::FailClosed);
        let (org, user) = ids();

        let err = h.service.require(&org, &user, &Permission::IMAGE_DELETE).await.unwrap_err();
        assert!(matches!(err, AuthzError::Denied { decided_by: DecisionSource::Authority, .. }));

        let err = h.service.require(&org, &user, &Permission::IMAGE_DELETE).await.unwrap_err();
        assert!(matches!(err, AuthzError::Denied { decided_by: DecisionSource::Cache, .. }));
    }

    #[tokio::test]
    async fn invalidation_forces_requery() {
        let h = harness(ScriptedAuthority::always_allow(), FailPolicy::FailClosed);
        let (org, user) = ids();

        h.service.check(&org, &user, &Permission::IMAGE_UPLOAD).await;
        assert_eq!(h.service.invalidate_subject(&org, &user).await.unwrap(), 1);

        let d = h.service.check(&org, &user, &Permission::IMAGE_UPLOAD).await;
        assert_eq!(d.source, DecisionSource::Authority);
        assert_eq!(h.authority.calls(), 2);
    }
}
