//! Job status transitions and worker-side retry decisions.
//!
//! ```text
//! (new) ──> Pending ──> Processing ──> Completed
//!              │             │   └───> Failed
//!              │             └──> Retrying ──> Processing
//!              └──> Failed   (pipeline compensation only)
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::types::{ImageVariant, Job, JobStatus, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("illegal job transition {from} -> {to}")]
    Illegal { from: JobStatus, to: JobStatus },
    #[error("retry budget exhausted ({attempts}/{max_retries})")]
    RetryBudgetExhausted { attempts: u32, max_retries: u32 },
    #[error("job is {0}, not pending")]
    NotPending(JobStatus),
}

impl JobStatus {
    /// Whether `self -> next` is an allowed status change.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Retrying)
                | (Retrying, Processing)
        )
    }
}

/// A single mutation of a job record. Applying one checks the transition
/// table and the retry budget before touching any field.
#[derive(Debug, Clone, PartialEq)]
pub enum JobUpdate {
    /// The submission handed the processing task to the broker. Only valid
    /// while `Pending`; the status does not change.
    MarkEnqueued,
    /// A worker picked the job up.
    StartProcessing,
    Complete {
        processed_paths: BTreeMap<ImageVariant, String>,
    },
    /// Transient failure; another attempt is scheduled.
    Retry { error: String },
    /// Terminal failure (compensation, permanent error or exhausted retries).
    Fail { error: String },
}

impl JobUpdate {
    /// Status after the update. `None` for `MarkEnqueued`, which keeps the
    /// job `Pending`.
    pub fn target_status(&self) -> Option<JobStatus> {
        match self {
            JobUpdate::MarkEnqueued => None,
            JobUpdate::StartProcessing => Some(JobStatus::Processing),
            JobUpdate::Complete { .. } => Some(JobStatus::Completed),
            JobUpdate::Retry { .. } => Some(JobStatus::Retrying),
            JobUpdate::Fail { .. } => Some(JobStatus::Failed),
        }
    }

    pub fn apply_to(self, job: &mut Job, now: DateTime<Utc>) -> Result<(), TransitionError> {
        let Some(to) = self.target_status() else {
            if job.status != JobStatus::Pending {
                return Err(TransitionError::NotPending(job.status));
            }
            job.enqueued_at = Some(now);
            job.updated_at = now;
            return Ok(());
        };

        if !job.status.can_transition_to(to) {
            return Err(TransitionError::Illegal { from: job.status, to });
        }

        match self {
            JobUpdate::MarkEnqueued => {}
            JobUpdate::StartProcessing => {
                job.started_at = Some(now);
            }
            JobUpdate::Complete { processed_paths } => {
                job.processed_paths = processed_paths;
                job.completed_at = Some(now);
                job.last_error = None;
            }
            JobUpdate::Retry { error } => {
                if job.attempt_count >= job.max_retries {
                    return Err(TransitionError::RetryBudgetExhausted {
                        attempts: job.attempt_count,
                        max_retries: job.max_retries,
                    });
                }
                job.attempt_count += 1;
                job.last_error = Some(error);
            }
            JobUpdate::Fail { error } => {
                job.last_error = Some(error);
            }
        }

        job.status = to;
        job.updated_at = now;
        Ok(())
    }
}

/// How a processing attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// Worth retrying (dependency hiccup, timeout).
    Transient,
    /// Retrying cannot help (unreadable payload, missing staging blob).
    Permanent,
}

/// What the worker should do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue after `delay`; `retry` is the new `attempt_count`.
    Retry { retry: u32, delay: Duration },
    GiveUp,
}

#[derive(Debug, Clone, Default)]
pub struct JobStateMachine {
    policy: RetryPolicy,
}

impl JobStateMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Decide between another attempt and terminal failure. The job's own
    /// `max_retries` is the budget; the policy only shapes the delay.
    pub fn on_failure(&self, job: &Job, kind: FailureKind) -> RetryDecision {
        if kind == FailureKind::Permanent || job.attempt_count >= job.max_retries {
            return RetryDecision::GiveUp;
        }

        let retry = job.attempt_count + 1;
        RetryDecision::Retry {
            retry,
            delay: self.policy.delay_for_retry(retry),
        }
    }
}
