//! Worker side of the pipeline: runs `process_image` tasks.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::broker::{InMemoryTaskBroker, TaskBroker, TaskMessage};
use crate::storage::BlobStore;

use super::state_machine::{FailureKind, JobStateMachine, JobUpdate, RetryDecision};
use super::store::{JobRecordStore, JobStoreError};
use super::types::{ImageVariant, Job, JobStatus};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessingError {
    #[error("transient processing failure: {0}")]
    Transient(String),
    #[error("permanent processing failure: {0}")]
    Permanent(String),
}

impl ProcessingError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ProcessingError::Transient(_) => FailureKind::Transient,
            ProcessingError::Permanent(_) => FailureKind::Permanent,
        }
    }
}

/// Turns a staged upload into encoded variants.
#[async_trait]
pub trait ImageProcessor: Send + Sync + core::fmt::Debug {
    async fn process(&self, job: &Job, staged: &[u8]) -> Result<BTreeMap<ImageVariant, Vec<u8>>, ProcessingError>;
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("malformed task '{0}'")]
    MalformedTask(String),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Result of handling one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    Completed,
    RetryScheduled { retry: u32 },
    Failed,
    /// Record missing, already terminal, or already being processed.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct JobWorker {
    jobs: Arc<dyn JobRecordStore>,
    blobs: Arc<dyn BlobStore>,
    broker: Arc<dyn TaskBroker>,
    processor: Arc<dyn ImageProcessor>,
    machine: JobStateMachine,
}

impl JobWorker {
    pub fn new(
        jobs: Arc<dyn JobRecordStore>,
        blobs: Arc<dyn BlobStore>,
        broker: Arc<dyn TaskBroker>,
        processor: Arc<dyn ImageProcessor>,
        machine: JobStateMachine,
    ) -> Self {
        Self {
            jobs,
            blobs,
            broker,
            processor,
            machine,
        }
    }

    /// Handle every task that is ready on `source`. Returns how many tasks
    /// were handled; malformed tasks are logged and dropped.
    pub async fn drain(&self, source: &InMemoryTaskBroker) -> Result<usize, WorkerError> {
        let mut handled = 0;
        while let Some(task) = source.next_ready() {
            match self.handle(&task).await {
                Ok(_) => {}
                Err(WorkerError::MalformedTask(name)) => warn!(task = %name, "dropping malformed task"),
                Err(e) => return Err(e),
            }
            handled += 1;
        }
        Ok(handled)
    }

    pub async fn handle(&self, task: &TaskMessage) -> Result<WorkOutcome, WorkerError> {
        let Some(payload) = task.process_image_payload() else {
            return Err(WorkerError::MalformedTask(task.name.clone()));
        };
        let job_id = payload.job_id;

        let Some(job) = self.jobs.get(job_id).await? else {
            warn!(%job_id, "job record missing; task dropped");
            return Ok(WorkOutcome::Skipped);
        };
        if !matches!(job.status, JobStatus::Pending | JobStatus::Retrying) {
            debug!(%job_id, status = %job.status, "duplicate delivery skipped");
            return Ok(WorkOutcome::Skipped);
        }

        let job = self.jobs.update_status(job_id, JobUpdate::StartProcessing).await?;
        info!(
            %job_id,
            image_id = %job.image_id,
            org_id = %job.org_id,
            attempt = job.attempt_count,
            "processing image job"
        );

        match self.attempt(&job).await {
            Ok(processed_paths) => self.complete(&job, processed_paths).await,
            Err(e) => self.fail(&job, e).await,
        }
    }

    async fn attempt(&self, job: &Job) -> Result<BTreeMap<ImageVariant, String>, ProcessingError> {
        let staging_path = job
            .staging_path
            .as_deref()
            .ok_or_else(|| ProcessingError::Permanent("job has no staged upload".into()))?;

        let staged = self
            .blobs
            .get(&job.bucket, staging_path)
            .await
            .map_err(|e| ProcessingError::Transient(e.to_string()))?
            .ok_or_else(|| ProcessingError::Permanent("staged upload missing".into()))?;

        let variants = self.processor.process(job, &staged).await?;

        let mut paths = BTreeMap::new();
        for (variant, bytes) in variants {
            let path = variant.processed_path(job.image_id);
            self.blobs
                .put(&job.bucket, &path, bytes)
                .await
                .map_err(|e| ProcessingError::Transient(e.to_string()))?;
            paths.insert(variant, path);
        }
        Ok(paths)
    }

    async fn complete(
        &self,
        job: &Job,
        processed_paths: BTreeMap<ImageVariant, String>,
    ) -> Result<WorkOutcome, WorkerError> {
        let variants = processed_paths.len();
        self.jobs
            .update_status(job.job_id, JobUpdate::Complete { processed_paths })
            .await?;

        if let Some(staging_path) = job.staging_path.as_deref() {
            if let Err(e) = self.blobs.delete(&job.bucket, staging_path).await {
                warn!(job_id = %job.job_id, %staging_path, error = %e, "staging cleanup failed");
            }
        }

        info!(job_id = %job.job_id, image_id = %job.image_id, variants, "image job completed");
        Ok(WorkOutcome::Completed)
    }

    async fn fail(&self, job: &Job, cause: ProcessingError) -> Result<WorkOutcome, WorkerError> {
        let error = cause.to_string();

        match self.machine.on_failure(job, cause.kind()) {
            RetryDecision::Retry { retry, delay } => {
                let task = TaskMessage::process_image(job.job_id).delayed(delay);
                if let Err(e) = self.broker.enqueue(task).await {
                    error!(job_id = %job.job_id, error = %e, "could not re-enqueue job; failing it");
                    self.jobs
                        .update_status(
                            job.job_id,
                            JobUpdate::Fail {
                                error: format!("{error}; retry could not be scheduled"),
                            },
                        )
                        .await?;
                    return Ok(WorkOutcome::Failed);
                }

                // The queued task skips anything not `Retrying`, so a job
                // whose retry cannot be recorded must not stay `Processing`.
                let update = JobUpdate::Retry { error: error.clone() };
                if let Err(e) = self.jobs.update_status(job.job_id, update).await {
                    error!(job_id = %job.job_id, error = %e, "could not record retry; failing job");
                    self.jobs
                        .update_status(
                            job.job_id,
                            JobUpdate::Fail {
                                error: format!("{error}; retry could not be recorded"),
                            },
                        )
                        .await?;
                    return Ok(WorkOutcome::Failed);
                }
                warn!(
                    job_id = %job.job_id,
                    retry,
                    max_retries = job.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "image job failed; retry scheduled"
                );
                Ok(WorkOutcome::RetryScheduled { retry })
            }
            RetryDecision::GiveUp => {
                self.jobs
                    .update_status(job.job_id, JobUpdate::Fail { error: error.clone() })
                    .await?;
                error!(
                    job_id = %job.job_id,
                    org_id = %job.org_id,
                    user_id = %job.user_id,
                    attempts = job.attempt_count,
                    %error,
                    "image job failed permanently"
                );
                Ok(WorkOutcome::Failed)
            }
        }
    }
}
