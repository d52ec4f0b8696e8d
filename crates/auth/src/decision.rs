use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Cache,
    Authority,
    FailOpen,
    FailClosed,
}

impl DecisionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Authority => "authority",
            Self::FailOpen => "fail_open",
            Self::FailClosed => "fail_closed",
        }
    }

    /// Whether the decision reflects an actual authority answer (live or
    /// cached) rather than the fail policy.
    pub fn is_authoritative(&self) -> bool {
        matches!(self, Self::Cache | Self::Authority)
    }
}

impl core::fmt::Display for DecisionSource {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Allow/deny outcome for an `(org, user, permission)` triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionDecision {
    pub allowed: bool,
    /// Expiry of the cached entry backing this decision. `None` for fail-policy
    /// decisions, which are never cached.
    pub expires_at: Option<DateTime<Utc>>,
    pub source: DecisionSource,
}

impl PermissionDecision {
    pub fn cached(allowed: bool, expires_at: DateTime<Utc>) -> Self {
        Self {
            allowed,
            expires_at: Some(expires_at),
            source: DecisionSource::Cache,
        }
    }

    pub fn from_authority(allowed: bool, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            allowed,
            expires_at,
            source: DecisionSource::Authority,
        }
    }
}

/// What to decide when the authority cannot be consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailPolicy {
    /// Deny. The gate protects write/delete operations, so this is the default.
    #[default]
    FailClosed,
    /// Allow.
    FailOpen,
}

impl FailPolicy {
    pub fn decide(self) -> PermissionDecision {
        match self {
            FailPolicy::FailClosed => PermissionDecision {
                allowed: false,
                expires_at: None,
                source: DecisionSource::FailClosed,
            },
            FailPolicy::FailOpen => PermissionDecision {
                allowed: true,
                expires_at: None,
                source: DecisionSource::FailOpen,
            },
        }
    }
}
