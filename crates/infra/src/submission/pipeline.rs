//! Submission workflow: authorize → create job → stage upload → enqueue.
//!
//! - Steps run strictly in order for one submission
//! - Each step reports a typed [`StepOutcome`]; the orchestrator never
//!   inspects raw collaborator errors
//! - A step that fails after the job record exists returns `Compensate`, and
//!   the orchestrator runs that step's single compensation before returning
//! - Every exit path leaves the job either accepted or `Failed`
//!
//! The caller supplies `job_id`, so a retried request maps onto the record
//! the first attempt created instead of producing a second one.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use imagegate_auth::Permission;
use imagegate_core::{Clock, ImageId, JobId, OrgId, SystemClock, UserId};

use crate::authz::AuthorizationService;
use crate::broker::{TaskBroker, TaskMessage};
use crate::jobs::{DEFAULT_MAX_RETRIES, Job, JobRecordStore, JobStatus, JobStoreError, JobUpdate, staging_path};
use crate::storage::BlobStore;

use super::error::SubmissionError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub bucket: String,
    pub required_permission: Permission,
    /// Copied onto each new job.
    pub max_retries: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            bucket: "images".to_string(),
            required_permission: Permission::IMAGE_UPLOAD,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubmissionRequest {
    pub job_id: JobId,
    pub org_id: OrgId,
    pub user_id: UserId,
    pub payload: Vec<u8>,
    /// Stored on the job as-is (filename, content type, ...).
    pub metadata: serde_json::Value,
}

/// Successful submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    pub job_id: JobId,
    pub image_id: ImageId,
    /// The job already existed from an earlier identical submission; no step
    /// after authorization ran again.
    pub replayed: bool,
}

/// Pipeline steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Authorize,
    CreateJob,
    StageBlob,
    EnqueueTask,
}

impl Step {
    pub const ORDER: [Step; 4] = [Step::Authorize, Step::CreateJob, Step::StageBlob, Step::EnqueueTask];

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Authorize => "authorize",
            Step::CreateJob => "create_job",
            Step::StageBlob => "stage_blob",
            Step::EnqueueTask => "enqueue_task",
        }
    }
}

/// What a step tells the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Proceed,
    /// Stop; nothing to undo.
    Abort(SubmissionError),
    /// Stop and run this step's compensation.
    Compensate(SubmissionError),
    /// Idempotent replay of an earlier submission; stop and accept it.
    Replay(Accepted),
}

/// Per-submission working state.
#[derive(Debug)]
struct Submission {
    request: SubmissionRequest,
    image_id: ImageId,
    staging_path: String,
}

#[derive(Debug, Clone)]
pub struct JobSubmissionPipeline {
    authz: AuthorizationService,
    jobs: Arc<dyn JobRecordStore>,
    blobs: Arc<dyn BlobStore>,
    broker: Arc<dyn TaskBroker>,
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
}

impl JobSubmissionPipeline {
    pub fn new(
        authz: AuthorizationService,
        jobs: Arc<dyn JobRecordStore>,
        blobs: Arc<dyn BlobStore>,
        broker: Arc<dyn TaskBroker>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            authz,
            jobs,
            blobs,
            broker,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn submit(&self, request: SubmissionRequest) -> Result<Accepted, SubmissionError> {
        let image_id = ImageId::new();
        let mut submission = Submission {
            staging_path: staging_path(image_id, self.clock.now()),
            image_id,
            request,
        };

        for step in Step::ORDER {
            let outcome = self.run(step, &mut submission).await;
            match outcome {
                StepOutcome::Proceed => {
                    debug!(job_id = %submission.request.job_id, step = step.as_str(), "submission step done");
                }
                StepOutcome::Abort(e) => {
                    warn!(
                        job_id = %submission.request.job_id,
                        org_id = %submission.request.org_id,
                        user_id = %submission.request.user_id,
                        step = step.as_str(),
                        code = e.code(),
                        "submission aborted"
                    );
                    return Err(e);
                }
                StepOutcome::Compensate(e) => {
                    self.compensate(step, &submission, &e).await;
                    return Err(e);
                }
                StepOutcome::Replay(accepted) => {
                    info!(
                        job_id = %accepted.job_id,
                        image_id = %accepted.image_id,
                        org_id = %submission.request.org_id,
                        "submission replayed"
                    );
                    return Ok(accepted);
                }
            }
        }

        info!(
            job_id = %submission.request.job_id,
            image_id = %submission.image_id,
            org_id = %submission.request.org_id,
            user_id = %submission.request.user_id,
            "image job accepted"
        );
        Ok(Accepted {
            job_id: submission.request.job_id,
            image_id: submission.image_id,
            replayed: false,
        })
    }

    async fn run(&self, step: Step, submission: &mut Submission) -> StepOutcome {
        match step {
            Step::Authorize => self.authorize(submission).await,
            Step::CreateJob => self.create_job(submission).await,
            Step::StageBlob => self.stage_blob(submission).await,
            Step::EnqueueTask => self.enqueue_task(submission).await,
        }
    }

    async fn authorize(&self, submission: &Submission) -> StepOutcome {
        let req = &submission.request;
        match self
            .authz
            .require(&req.org_id, &req.user_id, &self.config.required_permission)
            .await
        {
            Ok(_) => StepOutcome::Proceed,
            Err(e) => StepOutcome::Abort(e.into()),
        }
    }

    async fn create_job(&self, submission: &Submission) -> StepOutcome {
        let req = &submission.request;
        let job = Job::new(
            req.job_id,
            submission.image_id,
            req.org_id.clone(),
            req.user_id.clone(),
            self.config.bucket.clone(),
            self.clock.now(),
        )
        .with_staging_path(submission.staging_path.clone())
        .with_metadata(req.metadata.clone())
        .with_max_retries(self.config.max_retries);

        match self.jobs.insert(job).await {
            Ok(()) => StepOutcome::Proceed,
            Err(JobStoreError::AlreadyExists(job_id)) => self.existing_job(submission, job_id).await,
            Err(e) => {
                error!(job_id = %req.job_id, org_id = %req.org_id, user_id = %req.user_id, error = %e, "job insert failed");
                StepOutcome::Abort(SubmissionError::PersistenceFailure { job_id: req.job_id })
            }
        }
    }

    /// A record with this id exists. Replay it if it is the same caller's
    /// handed-off submission, report an unfinished one as in progress;
    /// anything else is a conflicting id. The existing record is never
    /// modified.
    async fn existing_job(&self, submission: &Submission, job_id: JobId) -> StepOutcome {
        let req = &submission.request;
        match self.jobs.get(job_id).await {
            Ok(Some(existing))
                if existing.org_id == req.org_id
                    && existing.user_id == req.user_id
                    && existing.status != JobStatus::Failed =>
            {
                if existing.is_handed_off() {
                    StepOutcome::Replay(Accepted {
                        job_id,
                        image_id: existing.image_id,
                        replayed: true,
                    })
                } else {
                    // The first attempt may still be compensated.
                    StepOutcome::Abort(SubmissionError::InProgress { job_id })
                }
            }
            Ok(_) => StepOutcome::Abort(SubmissionError::DuplicateJob { job_id }),
            Err(e) => {
                error!(%job_id, error = %e, "could not load existing job");
                StepOutcome::Abort(SubmissionError::PersistenceFailure { job_id })
            }
        }
    }

    async fn stage_blob(&self, submission: &mut Submission) -> StepOutcome {
        let job_id = submission.request.job_id;
        let payload = std::mem::take(&mut submission.request.payload);
        let bytes = payload.len();

        match self
            .blobs
            .put(&self.config.bucket, &submission.staging_path, payload)
            .await
        {
            Ok(()) => {
                debug!(%job_id, staging_path = %submission.staging_path, bytes, "upload staged");
                StepOutcome::Proceed
            }
            Err(e) => {
                error!(%job_id, staging_path = %submission.staging_path, error = %e, "staging upload failed");
                StepOutcome::Compensate(SubmissionError::StagingFailure { job_id })
            }
        }
    }

    async fn enqueue_task(&self, submission: &Submission) -> StepOutcome {
        let job_id = submission.request.job_id;
        if let Err(e) = self.broker.enqueue(TaskMessage::process_image(job_id)).await {
            error!(%job_id, error = %e, "processing task enqueue failed");
            return StepOutcome::Compensate(SubmissionError::EnqueueFailure { job_id });
        }

        // The task is out; from here on the job belongs to the worker, so a
        // lost marker is logged rather than compensated.
        match self.jobs.update_status(job_id, JobUpdate::MarkEnqueued).await {
            Ok(_) => {}
            Err(JobStoreError::Transition(e)) => debug!(%job_id, reason = %e, "job picked up before handoff mark"),
            Err(e) => warn!(%job_id, error = %e, "could not record task handoff"),
        }
        StepOutcome::Proceed
    }

    /// Undo the effects of the steps before `failed`. Compensation problems
    /// are logged; the caller still gets the step error.
    async fn compensate(&self, failed: Step, submission: &Submission, cause: &SubmissionError) {
        let req = &submission.request;

        if failed == Step::EnqueueTask {
            match self.blobs.delete(&self.config.bucket, &submission.staging_path).await {
                Ok(_) => debug!(job_id = %req.job_id, "staged upload removed"),
                Err(e) => warn!(
                    job_id = %req.job_id,
                    staging_path = %submission.staging_path,
                    error = %e,
                    "staged upload cleanup failed"
                ),
            }
        }

        let update = JobUpdate::Fail {
            error: format!("{}: {cause}", failed.as_str()),
        };
        match self.jobs.update_status(req.job_id, update).await {
            Ok(_) => warn!(
                job_id = %req.job_id,
                org_id = %req.org_id,
                user_id = %req.user_id,
                step = failed.as_str(),
                code = cause.code(),
                "submission compensated; job marked failed"
            ),
            Err(e) => error!(
                job_id = %req.job_id,
                org_id = %req.org_id,
                user_id = %req.user_id,
                step = failed.as_str(),
                error = %e,
                "could not mark job failed during compensation"
            ),
        }
    }
}
