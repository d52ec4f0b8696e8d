//! Breaker-guarded, time-bounded authority calls.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, warn};

use imagegate_auth::Permission;
use imagegate_core::{OrgId, UserId};

use super::authority::{AuthorityError, AuthorityService, AuthorityVerdict};
use super::breaker::{CallPermit, CircuitBreaker};

#[derive(Debug, Clone)]
pub struct AuthorityClient {
    authority: Arc<dyn AuthorityService>,
    breaker: Arc<CircuitBreaker>,
    timeout: Duration,
}

impl AuthorityClient {
    pub fn new(authority: Arc<dyn AuthorityService>, breaker: Arc<CircuitBreaker>, timeout: Duration) -> Self {
        Self {
            authority,
            breaker,
            timeout,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// One authority call. Never touches the network while the breaker
    /// refuses a permit; every attempted call reports its outcome to the
    /// breaker.
    pub async fn check(
        &self,
        org_id: &OrgId,
        user_id: &UserId,
        permission: &Permission,
    ) -> Result<AuthorityVerdict, AuthorityError> {
        let Some(permit) = self.breaker.try_acquire().await else {
            warn!(%org_id, %user_id, %permission, "authority circuit open; call skipped");
            return Err(AuthorityError::CircuitOpen);
        };

        let call = self.authority.check_permission(org_id, user_id, permission);
        let outcome = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(AuthorityError::Timeout(self.timeout)),
        };

        match &outcome {
            Ok(_) => self.breaker.record_success().await,
            Err(e) => {
                error!(
                    %org_id,
                    %user_id,
                    %permission,
                    error = %e,
                    trial = permit == CallPermit::Trial,
                    "authority call failed"
                );
                self.breaker.record_failure().await;
            }
        }

        outcome
    }
}
