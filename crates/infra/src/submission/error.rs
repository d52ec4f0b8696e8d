use thiserror::Error;

use imagegate_auth::{AuthzError, DecisionSource};
use imagegate_core::JobId;

/// Submission failure as seen by the caller.
///
/// Messages are deliberately generic; the underlying store or broker error
/// is logged at the failure site and never carried here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmissionError {
    #[error("forbidden: missing permission '{permission}'")]
    AuthorizationDenied {
        permission: String,
        decided_by: DecisionSource,
    },
    #[error("authorization temporarily unavailable")]
    AuthorityUnavailable { permission: String },
    #[error("failed to create image job")]
    PersistenceFailure { job_id: JobId },
    #[error("failed to upload image")]
    StagingFailure { job_id: JobId },
    #[error("failed to queue image for processing")]
    EnqueueFailure { job_id: JobId },
    #[error("job {job_id} already exists")]
    DuplicateJob { job_id: JobId },
    /// An earlier submission with this id has not finished yet.
    #[error("job {job_id} is still being submitted")]
    InProgress { job_id: JobId },
}

impl SubmissionError {
    /// Stable public error code.
    pub fn code(&self) -> &'static str {
        match self {
            SubmissionError::AuthorizationDenied { .. } => "AUTH_002",
            SubmissionError::AuthorityUnavailable { .. } => "AUTH_004",
            SubmissionError::PersistenceFailure { .. } => "JOB_001",
            SubmissionError::StagingFailure { .. } => "JOB_002",
            SubmissionError::EnqueueFailure { .. } => "JOB_003",
            SubmissionError::DuplicateJob { .. } => "JOB_005",
            SubmissionError::InProgress { .. } => "JOB_006",
        }
    }

    /// Whether the job record was left behind in `Failed`.
    pub fn compensated(&self) -> bool {
        matches!(
            self,
            SubmissionError::StagingFailure { .. } | SubmissionError::EnqueueFailure { .. }
        )
    }
}

impl From<AuthzError> for SubmissionError {
    fn from(e: AuthzError) -> Self {
        match e {
            AuthzError::Denied { permission, decided_by } => {
                SubmissionError::AuthorizationDenied { permission, decided_by }
            }
            AuthzError::Unavailable { permission } => SubmissionError::AuthorityUnavailable { permission },
        }
    }
}
