use thiserror::Error;

use crate::{DecisionSource, Permission, PermissionDecision};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    /// The authority (live or cached) said no. Never retried.
    #[error("forbidden: missing permission '{permission}'")]
    Denied {
        permission: String,
        decided_by: DecisionSource,
    },

    /// The authority could not be consulted and the fail policy denied access.
    #[error("authorization temporarily unavailable")]
    Unavailable { permission: String },
}

impl AuthzError {
    /// Stable public error code.
    pub fn code(&self) -> &'static str {
        match self {
            AuthzError::Denied { .. } => "AUTH_002",
            AuthzError::Unavailable { .. } => "AUTH_004",
        }
    }
}

/// Turn a decision into a gate result.
pub fn enforce(permission: &Permission, decision: PermissionDecision) -> Result<PermissionDecision, AuthzError> {
    if decision.allowed {
        return Ok(decision);
    }

    if decision.source.is_authoritative() {
        Err(AuthzError::Denied {
            permission: permission.as_str().to_string(),
            decided_by: decision.source,
        })
    } else {
        Err(AuthzError::Unavailable {
            permission: permission.as_str().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FailPolicy;

    #[test]
    fn authoritative_denial_keeps_its_source() {
        let decision = PermissionDecision::cached(false, chrono::Utc::now());
        let err = enforce(&Permission::IMAGE_DELETE, decision).unwrap_err();
        assert_eq!(
            err,
            AuthzError::Denied {
                permission: "image:delete".into(),
                decided_by: DecisionSource::Cache,
            }
        );
        assert_eq!(err.code(), "AUTH_002");
    }

    #[test]
    fn fail_closed_surfaces_as_unavailable() {
        let err = enforce(&Permission::IMAGE_UPLOAD, FailPolicy::FailClosed.decide()).unwrap_err();
        assert!(matches!(err, AuthzError::Unavailable { .. }));
    }

    #[test]
    fn allowed_decision_passes_through() {
        let decision = FailPolicy::FailOpen.decide();
        assert_eq!(enforce(&Permission::IMAGE_UPLOAD, decision.clone()), Ok(decision));
    }
}
