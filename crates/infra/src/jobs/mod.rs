//! Image-processing jobs: record, state machine, storage, worker and
//! staging cleanup.
//!
//! - `Job`: one upload and its processing state
//! - `JobUpdate` / `JobStateMachine`: allowed transitions and retry decisions
//! - `JobRecordStore`: persistence (in-memory for dev/test)
//! - `JobWorker`: runs `process_image` tasks with bounded retry
//! - `StagingSweeper`: removes staging blobs of stale jobs

pub mod cleanup;
pub mod state_machine;
pub mod store;
pub mod types;
pub mod worker;

pub use cleanup::{ABANDONED_ERROR, StagingSweeper, SweepReport};
pub use state_machine::{FailureKind, JobStateMachine, JobUpdate, RetryDecision, TransitionError};
pub use store::{InMemoryJobRecordStore, JobRecordStore, JobStats, JobStoreError};
pub use types::{BackoffStrategy, DEFAULT_MAX_RETRIES, ImageVariant, Job, JobStatus, RetryPolicy, staging_path};
pub use worker::{ImageProcessor, JobWorker, ProcessingError, WorkOutcome, WorkerError};
