//! `imagegate-infra`: adapters and services behind the upload gate.
//!
//! - [`authz`]: permission cache, shared circuit breaker, authority client
//!   and the authorization service combining them.
//! - [`submission`]: the compensating job-submission pipeline.
//! - [`jobs`]: job records, the status state machine, the retrying worker
//!   and the staging sweeper.
//! - [`shared_store`], [`storage`], [`broker`]: collaborator traits with
//!   in-memory implementations (and Redis behind the `redis` feature).

pub mod authz;
pub mod broker;
pub mod config;
pub mod jobs;
pub mod shared_store;
pub mod storage;
pub mod submission;

#[cfg(test)]
mod testing;
