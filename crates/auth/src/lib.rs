//! `imagegate-auth`: authorization vocabulary (no IO).
//!
//! Permissions, their sensitivity classes, decisions and the fail policy live
//! here. The cache, breaker and authority plumbing that produce decisions are
//! in `imagegate-infra`.

pub mod authorize;
pub mod decision;
pub mod permissions;
pub mod ttl;

pub use authorize::{enforce, AuthzError};
pub use decision::{DecisionSource, FailPolicy, PermissionDecision};
pub use permissions::{Permission, PermissionClass};
pub use ttl::DecisionTtls;
