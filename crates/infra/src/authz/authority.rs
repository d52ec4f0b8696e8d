//! The external authority that owns group/permission membership.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use imagegate_auth::Permission;
use imagegate_core::{OrgId, UserId};

/// Authority answer. A denial is a successful answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityVerdict {
    pub allowed: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

impl AuthorityVerdict {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthorityError {
    /// The breaker refused the call; no network I/O happened.
    #[error("authority circuit open")]
    CircuitOpen,
    #[error("authority call timed out after {0:?}")]
    Timeout(Duration),
    #[error("authority transport error: {0}")]
    Transport(String),
    #[error("authority returned unexpected status {0}")]
    UnexpectedStatus(u16),
}

#[async_trait]
pub trait AuthorityService: Send + Sync + core::fmt::Debug {
    async fn check_permission(
        &self,
        org_id: &OrgId,
        user_id: &UserId,
        permission: &Permission,
    ) -> Result<AuthorityVerdict, AuthorityError>;
}

#[derive(Debug, Serialize)]
struct CheckRequest<'a> {
    org_id: &'a str,
    user_id: &'a str,
    permission: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct DenialBody {
    reason: Option<String>,
}

/// HTTP authority client.
///
/// `POST {base_url}/api/v1/authorization/check` with
/// `{org_id, user_id, permission}`: `200` means allowed, `403` means denied,
/// any other status is an authority failure. Timeouts are enforced by
/// [`super::AuthorityClient`], not here.
#[derive(Debug, Clone)]
pub struct HttpAuthority {
    http: reqwest::Client,
    check_url: String,
}

impl HttpAuthority {
    pub fn new(base_url: impl AsRef<str>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(http: reqwest::Client, base_url: impl AsRef<str>) -> Self {
        let base = base_url.as_ref().trim_end_matches('/');
        Self {
            http,
            check_url: format!("{base}/api/v1/authorization/check"),
        }
    }
}

#[async_trait]
impl AuthorityService for HttpAuthority {
    async fn check_permission(
        &self,
        org_id: &OrgId,
        user_id: &UserId,
        permission: &Permission,
    ) -> Result<AuthorityVerdict, AuthorityError> {
        let response = self
            .http
            .post(&self.check_url)
            .json(&CheckRequest {
                org_id: org_id.as_str(),
                user_id: user_id.as_str(),
                permission: permission.as_str(),
            })
            .send()
            .await
            .map_err(|e| AuthorityError::Transport(e.to_string()))?;

        match response.status() {
            reqwest::StatusCode::OK => {
                debug!(%org_id, %user_id, %permission, "authority granted permission");
                Ok(AuthorityVerdict::allowed())
            }
            reqwest::StatusCode::FORBIDDEN => {
                let body: DenialBody = response.json().await.unwrap_or_default();
                let reason = body.reason.unwrap_or_else(|| "permission_denied".to_string());
                debug!(%org_id, %user_id, %permission, %reason, "authority denied permission");
                Ok(AuthorityVerdict::denied(reason))
            }
            status => {
                warn!(%org_id, %user_id, %permission, status = status.as_u16(), "authority error response");
                Err(AuthorityError::UnexpectedStatus(status.as_u16()))
            }
        }
    }
}
