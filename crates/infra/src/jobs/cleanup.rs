//! Removes staging blobs left behind by failed or abandoned jobs.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use imagegate_core::{Clock, SystemClock};

use crate::storage::BlobStore;

use super::state_machine::JobUpdate;
use super::store::{JobRecordStore, JobStoreError};
use super::types::JobStatus;

/// Jobs examined per sweep.
const SWEEP_BATCH: usize = 500;

/// `last_error` of a `Pending` job failed by the sweeper.
pub const ABANDONED_ERROR: &str = "abandoned before processing";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Stale jobs that still pointed at a staging blob.
    pub examined: usize,
    pub deleted: usize,
    /// Blob already gone.
    pub missing: usize,
    /// `Pending` jobs failed because nothing picked them up in time.
    pub abandoned: usize,
    /// Failed deletes or record updates; retried on the next sweep.
    pub errors: usize,
}

#[derive(Debug, Clone)]
pub struct StagingSweeper {
    jobs: Arc<dyn JobRecordStore>,
    blobs: Arc<dyn BlobStore>,
    max_age: Duration,
    clock: Arc<dyn Clock>,
}

impl StagingSweeper {
    pub fn new(jobs: Arc<dyn JobRecordStore>, blobs: Arc<dyn BlobStore>, max_age: Duration) -> Self {
        Self {
            jobs,
            blobs,
            max_age,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sweep jobs older than the configured max age.
    pub async fn sweep_expired(&self) -> Result<SweepReport, JobStoreError> {
        let cutoff = chrono::Duration::from_std(self.max_age)
            .ok()
            .and_then(|age| self.clock.now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.sweep(cutoff).await
    }

    /// Delete staging blobs of `Failed` and `Pending` jobs created before
    /// `cutoff`. A `Pending` job is failed first and keeps its blob if that
    /// update is rejected. Once a blob is gone the job stops referencing it,
    /// so each sweep only sees work that is left. Individual failures are
    /// counted, never fatal.
    pub async fn sweep(&self, cutoff: DateTime<Utc>) -> Result<SweepReport, JobStoreError> {
        let stale = self
            .jobs
            .list_stale(&[JobStatus::Failed, JobStatus::Pending], cutoff, SWEEP_BATCH)
            .await?;

        let mut report = SweepReport::default();
        for job in stale {
            let Some(path) = job.staging_path.as_deref() else {
                continue;
            };
            report.examined += 1;

            if job.status == JobStatus::Pending {
                let update = JobUpdate::Fail {
                    error: ABANDONED_ERROR.to_string(),
                };
                match self.jobs.update_status(job.job_id, update).await {
                    Ok(_) => {
                        report.abandoned += 1;
                        warn!(job_id = %job.job_id, org_id = %job.org_id, created_at = %job.created_at, "abandoned pending job failed");
                    }
                    Err(JobStoreError::Transition(e)) => {
                        debug!(job_id = %job.job_id, reason = %e, "job left pending during sweep; kept");
                        continue;
                    }
                    Err(e) => {
                        report.errors += 1;
                        warn!(job_id = %job.job_id, error = %e, "could not fail abandoned job");
                        continue;
                    }
                }
            }

            match self.blobs.delete(&job.bucket, path).await {
                Ok(true) => report.deleted += 1,
                Ok(false) => report.missing += 1,
                Err(e) => {
                    report.errors += 1;
                    warn!(job_id = %job.job_id, staging_path = %path, error = %e, "staging sweep delete failed");
                    continue;
                }
            }

            if let Err(e) = self.jobs.clear_staging_path(job.job_id).await {
                report.errors += 1;
                warn!(job_id = %job.job_id, error = %e, "could not clear staging path");
            }
        }

        info!(
            %cutoff,
            examined = report.examined,
            deleted = report.deleted,
            missing = report.missing,
            abandoned = report.abandoned,
            errors = report.errors,
            "staging sweep finished"
        );
        Ok(report)
    }
}
