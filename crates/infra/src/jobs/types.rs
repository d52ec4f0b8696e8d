//! Image-processing job record and retry policy.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use imagegate_core::{ImageId, JobId, OrgId, UserId};

/// Default number of worker-side retries per job.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Recorded, staged and handed to the broker; not picked up yet
    Pending,
    /// A worker is processing it
    Processing,
    /// Variants written
    Completed,
    /// Terminal failure, see `last_error`
    Failed,
    /// Transient failure, re-enqueued with backoff
    Retrying,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Retrying,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output sizes produced for every image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageVariant {
    Thumbnail,
    Medium,
    Large,
    Original,
}

impl ImageVariant {
    pub const ALL: [ImageVariant; 4] = [
        ImageVariant::Thumbnail,
        ImageVariant::Medium,
        ImageVariant::Large,
        ImageVariant::Original,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageVariant::Thumbnail => "thumbnail",
            ImageVariant::Medium => "medium",
            ImageVariant::Large => "large",
            ImageVariant::Original => "original",
        }
    }

    /// Longest edge in pixels.
    pub fn max_dimension(&self) -> u32 {
        match self {
            ImageVariant::Thumbnail => 150,
            ImageVariant::Medium => 600,
            ImageVariant::Large => 1200,
            ImageVariant::Original => 4096,
        }
    }

    pub fn processed_path(&self, image_id: ImageId) -> String {
        format!("processed/{}/{image_id}_{}.webp", self.as_str(), self.as_str())
    }
}

/// Blob path an upload is staged under before processing.
pub fn staging_path(image_id: ImageId, at: DateTime<Utc>) -> String {
    format!("staging/{image_id}_{}", at.timestamp())
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// base * 2^(retry-1)
    #[default]
    Exponential,
    /// base * retry
    Linear,
}

/// Worker-side retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed per job (0 = no retries). Copied onto each job at
    /// creation as `max_retries`.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(120),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before retry number `retry` (1-indexed). Never exceeds
    /// `max_delay`, jitter included.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => base_ms * 2_f64.powi(retry.saturating_sub(1).min(62) as i32),
            BackoffStrategy::Linear => base_ms * f64::from(retry),
        }
        .min(max_ms);

        // Deterministic jitter so retries of the same job are reproducible.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((f64::from(retry) * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).clamp(0.0, max_ms) as u64)
    }
}

/// One image-processing job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub image_id: ImageId,
    pub org_id: OrgId,
    pub user_id: UserId,
    pub status: JobStatus,
    pub bucket: String,
    pub staging_path: Option<String>,
    pub processed_paths: BTreeMap<ImageVariant, String>,
    /// Caller-supplied metadata (filename, content type, ...)
    pub metadata: serde_json::Value,
    /// Retries scheduled so far; never exceeds `max_retries`
    pub attempt_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set once the processing task was handed to the broker. A `Pending`
    /// job without it is still inside its submission.
    #[serde(default)]
    pub enqueued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        job_id: JobId,
        image_id: ImageId,
        org_id: OrgId,
        user_id: UserId,
        bucket: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            image_id,
            org_id,
            user_id,
            status: JobStatus::Pending,
            bucket: bucket.into(),
            staging_path: None,
            processed_paths: BTreeMap::new(),
            metadata: serde_json::Value::Null,
            attempt_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            last_error: None,
            created_at: now,
            updated_at: now,
            enqueued_at: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_staging_path(mut self, staging_path: impl Into<String>) -> Self {
        self.staging_path = Some(staging_path.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Accepted and handed off: the submission that created it has finished.
    pub fn is_handed_off(&self) -> bool {
        self.enqueued_at.is_some() || !matches!(self.status, JobStatus::Pending | JobStatus::Failed)
    }

    pub fn retries_left(&self) -> u32 {
        self.max_retries.saturating_sub(self.attempt_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_until_cap() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_millis(500))
        };

        assert_eq!(policy.delay_for_retry(0), Duration::ZERO);
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_retry(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for_retry(200), Duration::from_millis(500));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(300));
    }

    #[test]
    fn jitter_is_deterministic_and_capped() {
        let policy = RetryPolicy::default();
        for retry in 1..10 {
            let delay = policy.delay_for_retry(retry);
            assert_eq!(delay, policy.delay_for_retry(retry));
            assert!(delay <= policy.max_delay);
        }
    }

    #[test]
    fn variant_paths() {
        let image_id = ImageId::new();
        assert_eq!(
            ImageVariant::Thumbnail.processed_path(image_id),
            format!("processed/thumbnail/{image_id}_thumbnail.webp")
        );
        assert_eq!(ImageVariant::Original.max_dimension(), 4096);

        let at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(staging_path(image_id, at), format!("staging/{image_id}_1700000000"));
    }

    #[test]
    fn new_job_is_pending_with_default_budget() {
        let job = Job::new(
            JobId::new(),
            ImageId::new(),
            OrgId::new("org-1").unwrap(),
            UserId::new("user-1").unwrap(),
            "images",
            Utc::now(),
        );
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.retries_left(), 3);
        assert!(job.processed_paths.is_empty());
    }
}
