//! Test doubles for the external collaborators.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use chrono::{DateTime, Utc};

use imagegate_auth::Permission;
use imagegate_core::{JobId, OrgId, UserId};

use crate::authz::{AuthorityError, AuthorityService, AuthorityVerdict};
use crate::broker::{BrokerError, TaskBroker, TaskMessage};
use crate::jobs::{
    ImageProcessor, ImageVariant, InMemoryJobRecordStore, Job, JobRecordStore, JobStats, JobStatus, JobStoreError, JobUpdate,
    ProcessingError,
};
use crate::shared_store::{SharedCacheStore, StoreError};
use crate::storage::{BlobError, BlobStore, InMemoryBlobStore};

/// Shared store whose every operation fails as if the server were down.
#[derive(Debug, Default)]
pub struct UnavailableStore;

fn down() -> StoreError {
    StoreError::Unavailable("connection refused".into())
}

#[async_trait]
impl SharedCacheStore for UnavailableStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Err(down())
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> Result<(), StoreError> {
        Err(down())
    }

    async fn atomic_increment(&self, _key: &str) -> Result<i64, StoreError> {
        Err(down())
    }

    async fn compare_and_swap(
        &self,
        _key: &str,
        _expected: Option<&str>,
        _new: &str,
        _ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        Err(down())
    }

    async fn delete(&self, _key: &str) -> Result<bool, StoreError> {
        Err(down())
    }

    async fn scan_prefix(&self, _prefix: &str) -> Result<Vec<String>, StoreError> {
        Err(down())
    }
}

/// Authority answering from a script: `Ok(allowed)` or `Err(())` for a
/// transport failure. The last entry repeats once the script runs out.
#[derive(Debug)]
pub struct ScriptedAuthority {
    script: Mutex<VecDeque<Result<bool, ()>>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedAuthority {
    pub fn script(answers: impl IntoIterator<Item = Result<bool, ()>>) -> Self {
        Self {
            script: Mutex::new(answers.into_iter().collect()),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn always_allow() -> Self {
        Self::script([Ok(true)])
    }

    pub fn always_deny() -> Self {
        Self::script([Ok(false)])
    }

    pub fn always_fail() -> Self {
        Self::script([Err(())])
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_answer(&self) -> Result<bool, ()> {
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            script.pop_front().unwrap_or(Err(()))
        } else {
            script.front().copied().unwrap_or(Err(()))
        }
    }
}

#[async_trait]
impl AuthorityService for ScriptedAuthority {
    async fn check_permission(
        &self,
        _org_id: &OrgId,
        _user_id: &UserId,
        _permission: &Permission,
    ) -> Result<AuthorityVerdict, AuthorityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.next_answer() {
            Ok(true) => Ok(AuthorityVerdict::allowed()),
            Ok(false) => Ok(AuthorityVerdict::denied("not_in_group")),
            Err(()) => Err(AuthorityError::Transport("connection reset".into())),
        }
    }
}

/// In-memory blob store with switchable put/delete failures.
#[derive(Debug, Default)]
pub struct FlakyBlobStore {
    pub inner: InMemoryBlobStore,
    fail_put: AtomicBool,
    fail_delete: AtomicBool,
}

impl FlakyBlobStore {
    pub fn failing_puts() -> Self {
        let store = Self::default();
        store.fail_put.store(true, Ordering::SeqCst);
        store
    }

    pub fn failing_deletes() -> Self {
        let store = Self::default();
        store.fail_delete.store(true, Ordering::SeqCst);
        store
    }
}

#[async_trait]
impl BlobStore for FlakyBlobStore {
    async fn put(&self, bucket: &str, path: &str, bytes: Vec<u8>) -> Result<(), BlobError> {
        if self.fail_put.load(Ordering::SeqCst) {
            return Err(BlobError::Unavailable("minio: connection refused".into()));
        }
        self.inner.put(bucket, path, bytes).await
    }

    async fn get(&self, bucket: &str, path: &str) -> Result<Option<Vec<u8>>, BlobError> {
        self.inner.get(bucket, path).await
    }

    async fn delete(&self, bucket: &str, path: &str) -> Result<bool, BlobError> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(BlobError::Unavailable("minio: connection refused".into()));
        }
        self.inner.delete(bucket, path).await
    }
}

/// Broker that refuses every task.
#[derive(Debug, Default)]
pub struct FailingBroker;

#[async_trait]
impl TaskBroker for FailingBroker {
    async fn enqueue(&self, _task: TaskMessage) -> Result<(), BrokerError> {
        Err(BrokerError::Unavailable("redis: connection refused".into()))
    }
}

/// Broker that signals `entered` on enqueue, then blocks until `release`
/// and refuses the task.
#[derive(Debug, Default)]
pub struct GatedBroker {
    pub entered: Notify,
    pub release: Notify,
}

impl GatedBroker {
    pub fn failing() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskBroker for GatedBroker {
    async fn enqueue(&self, _task: TaskMessage) -> Result<(), BrokerError> {
        self.entered.notify_one();
        self.release.notified().await;
        Err(BrokerError::Unavailable("redis: connection reset".into()))
    }
}

/// Record store whose inserts fail.
#[derive(Debug, Default)]
pub struct FailingJobStore;

#[async_trait]
impl JobRecordStore for FailingJobStore {
    async fn insert(&self, _job: Job) -> Result<(), JobStoreError> {
        Err(JobStoreError::Storage("postgres: too many connections".into()))
    }

    async fn update_status(&self, job_id: JobId, _update: JobUpdate) -> Result<Job, JobStoreError> {
        Err(JobStoreError::NotFound(job_id))
    }

    async fn get(&self, _job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(None)
    }

    async fn list_stale(
        &self,
        _statuses: &[JobStatus],
        _created_before: DateTime<Utc>,
        _limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        Ok(Vec::new())
    }

    async fn clear_staging_path(&self, job_id: JobId) -> Result<(), JobStoreError> {
        Err(JobStoreError::NotFound(job_id))
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        Ok(JobStats::default())
    }
}

/// In-memory record store that times out on every `Retry` update.
#[derive(Debug, Default)]
pub struct RetryRejectingStore {
    pub inner: InMemoryJobRecordStore,
}

#[async_trait]
impl JobRecordStore for RetryRejectingStore {
    async fn insert(&self, job: Job) -> Result<(), JobStoreError> {
        self.inner.insert(job).await
    }

    async fn update_status(&self, job_id: JobId, update: JobUpdate) -> Result<Job, JobStoreError> {
        if matches!(update, JobUpdate::Retry { .. }) {
            return Err(JobStoreError::Storage("write timeout".into()));
        }
        self.inner.update_status(job_id, update).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.inner.get(job_id).await
    }

    async fn list_stale(
        &self,
        statuses: &[JobStatus],
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        self.inner.list_stale(statuses, created_before, limit).await
    }

    async fn clear_staging_path(&self, job_id: JobId) -> Result<(), JobStoreError> {
        self.inner.clear_staging_path(job_id).await
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        self.inner.stats().await
    }
}

/// Processor answering from a script; the last entry repeats.
#[derive(Debug)]
pub struct ScriptedProcessor {
    script: Mutex<VecDeque<Result<(), ProcessingError>>>,
    calls: AtomicUsize,
}

impl ScriptedProcessor {
    pub fn script(outcomes: impl IntoIterator<Item = Result<(), ProcessingError>>) -> Self {
        Self {
            script: Mutex::new(outcomes.into_iter().collect()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn succeeding() -> Self {
        Self::script([Ok(())])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageProcessor for ScriptedProcessor {
    async fn process(&self, _job: &Job, staged: &[u8]) -> Result<BTreeMap<ImageVariant, Vec<u8>>, ProcessingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = {
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            }
        };
        match outcome {
            Some(Err(e)) => Err(e),
            _ => Ok(ImageVariant::ALL.iter().map(|v| (*v, staged.to_vec())).collect()),
        }
    }
}
