//! `imagegate-core`: identifiers, clock and error primitives shared by every
//! imagegate crate.
//!
//! This crate has no IO; collaborators and adapters live in `imagegate-infra`.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{ImageId, JobId, OrgId, UserId};
