//! Job record storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use imagegate_core::{Clock, JobId, SystemClock};

use super::state_machine::{JobUpdate, TransitionError};
use super::types::{Job, JobStatus};

/// Durable job record store.
///
/// Implementations must give the submitting process read-your-writes
/// consistency, and `update_status` must reject changes the state machine
/// does not allow.
#[async_trait]
pub trait JobRecordStore: Send + Sync + core::fmt::Debug {
    /// Insert a new record. Fails with `AlreadyExists` on a duplicate id.
    async fn insert(&self, job: Job) -> Result<(), JobStoreError>;

    /// Apply one update atomically; returns the record as written.
    async fn update_status(&self, job_id: JobId, update: JobUpdate) -> Result<Job, JobStoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Jobs in any of `statuses` created before `created_before` that still
    /// reference a staging blob, oldest first.
    async fn list_stale(
        &self,
        statuses: &[JobStatus],
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Forget the staging blob reference once the blob is gone.
    async fn clear_staging_path(&self, job_id: JobId) -> Result<(), JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub retrying: usize,
}

impl JobStats {
    fn count(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Processing => self.processing += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Retrying => self.retrying += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed + self.retrying
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug)]
pub struct InMemoryJobRecordStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryJobRecordStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<JobId, Job>> {
        self.jobs.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<JobId, Job>> {
        self.jobs.write().unwrap_or_else(|p| p.into_inner())
    }
}

impl Default for InMemoryJobRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobRecordStore for InMemoryJobRecordStore {
    async fn insert(&self, job: Job) -> Result<(), JobStoreError> {
        let mut jobs = self.write();
        if jobs.contains_key(&job.job_id) {
            return Err(JobStoreError::AlreadyExists(job.job_id));
        }
        jobs.insert(job.job_id, job);
        Ok(())
    }

    async fn update_status(&self, job_id: JobId, update: JobUpdate) -> Result<Job, JobStoreError> {
        let now = self.clock.now();
        let mut jobs = self.write();
        let stored = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;

        // Apply to a copy so a rejected update leaves the record untouched.
        let mut next = stored.clone();
        update.apply_to(&mut next, now)?;
        *stored = next.clone();
        Ok(next)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read().get(&job_id).cloned())
    }

    async fn list_stale(
        &self,
        statuses: &[JobStatus],
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let mut result: Vec<_> = self
            .read()
            .values()
            .filter(|j| {
                j.staging_path.is_some() && statuses.contains(&j.status) && j.created_at < created_before
            })
            .cloned()
            .collect();

        result.sort_by_key(|j| j.created_at);
        result.truncate(limit);
        Ok(result)
    }

    async fn clear_staging_path(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let now = self.clock.now();
        let mut jobs = self.write();
        let stored = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if stored.staging_path.take().is_some() {
            stored.updated_at = now;
        }
        Ok(())
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let mut stats = JobStats::default();
        for job in self.read().values() {
            stats.count(job.status);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use imagegate_core::{ImageId, ManualClock, OrgId, UserId};

    fn job_at(at: DateTime<Utc>) -> Job {
        Job::new(
            JobId::new(),
            ImageId::new(),
            OrgId::new("org-1").unwrap(),
            UserId::new("user-1").unwrap(),
            "images",
            at,
        )
        .with_staging_path("staging/x")
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected_without_overwrite() {
        let store = InMemoryJobRecordStore::new();
        let job = job_at(Utc::now());
        store.insert(job.clone()).await.unwrap();

        let mut dup = job.clone();
        dup.bucket = "other".into();
        assert_eq!(store.insert(dup).await, Err(JobStoreError::AlreadyExists(job.job_id)));
        assert_eq!(store.get(job.job_id).await.unwrap().unwrap().bucket, "images");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn update_status_stamps_clock_and_rejects_illegal_moves() {
        let clock = ManualClock::starting_now();
        let store = InMemoryJobRecordStore::with_clock(Arc::new(clock.clone()));
        let job = job_at(clock.now());
        store.insert(job.clone()).await.unwrap();

        clock.advance(Duration::from_secs(5));
        let updated = store.update_status(job.job_id, JobUpdate::StartProcessing).await.unwrap();
        assert_eq!(updated.status, JobStatus::Processing);
        assert_eq!(updated.started_at, Some(clock.now()));

        clock.advance(Duration::from_secs(5));
        let err = store.update_status(job.job_id, JobUpdate::StartProcessing).await.unwrap_err();
        assert!(matches!(err, JobStoreError::Transition(TransitionError::Illegal { .. })));
        assert_eq!(store.get(job.job_id).await.unwrap().unwrap(), updated);
    }

    #[tokio::test]
    async fn update_of_unknown_job_is_not_found() {
        let store = InMemoryJobRecordStore::new();
        let id = JobId::new();
        assert_eq!(
            store.update_status(id, JobUpdate::StartProcessing).await,
            Err(JobStoreError::NotFound(id))
        );
    }

    #[tokio::test]
    async fn list_stale_filters_by_status_and_age() {
        let store = InMemoryJobRecordStore::new();
        let now = Utc::now();
        let old = job_at(now - chrono::Duration::hours(30));
        let older = job_at(now - chrono::Duration::hours(48));
        let fresh = job_at(now);
        for j in [&old, &older, &fresh] {
            store.insert(j.clone()).await.unwrap();
        }
        store.update_status(old.job_id, JobUpdate::StartProcessing).await.unwrap();

        let cutoff = now - chrono::Duration::hours(24);
        let stale = store.list_stale(&[JobStatus::Pending, JobStatus::Failed], cutoff, 10).await.unwrap();
        assert_eq!(stale.iter().map(|j| j.job_id).collect::<Vec<_>>(), vec![older.job_id]);

        store.clear_staging_path(older.job_id).await.unwrap();
        assert!(store.list_stale(&[JobStatus::Pending], cutoff, 10).await.unwrap().is_empty());
        assert_eq!(store.get(older.job_id).await.unwrap().unwrap().status, JobStatus::Pending);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.total(), 3);
    }
}
