//! Permission decisions: cache, breaker, authority client and the service
//! that ties them together.

pub mod authority;
pub mod breaker;
pub mod cache;
pub mod client;
pub mod service;

pub use authority::{AuthorityError, AuthorityService, AuthorityVerdict, HttpAuthority};
pub use breaker::{BreakerConfig, CallPermit, CircuitBreaker, CircuitSnapshot, CircuitState};
pub use cache::{DecisionKey, PermissionCache};
pub use client::AuthorityClient;
pub use service::{AUDIT_TARGET, AuthorizationService};
