//! Job state store client.
//!
//! Every method is one atomic transition on the backing store. The engine
//! relies on that: two workers can never both hold a valid lock on a job, and
//! reports from a worker whose lock is gone are rejected with
//! [`StoreError::LockMismatch`].

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use taskmill_core::{CoreError, Job, JobFailure, JobId, JobOptions, JobState, LockToken};

pub use in_memory::InMemoryJobStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisJobStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// Store errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    /// The caller no longer owns the job (lock expired, stolen or the job
    /// already moved on).
    #[error("lock mismatch for job {0}")]
    LockMismatch(JobId),

    /// Transient transport/backend failure.
    #[error("store communication error: {0}")]
    Communication(String),

    #[error("store state poisoned")]
    Poisoned,

    #[error("invalid job: {0}")]
    Invalid(String),
}

impl StoreError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Communication(_))
    }
}

impl From<CoreError> for StoreError {
    fn from(value: CoreError) -> Self {
        StoreError::Invalid(value.to_string())
    }
}

/// Result of [`JobStore::fetch_next_job`].
#[derive(Debug, Clone, PartialEq)]
pub enum NextJob {
    /// A job moved to `active`, locked by the caller's token.
    Job(Box<Job>),
    /// Nothing waiting.
    Empty,
    /// The queue rate limit is saturated for `retry_after`.
    RateLimited { retry_after: Duration },
}

/// Where [`JobStore::mark_failed`] moved a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedTransition {
    /// Back to `waiting` for an immediate retry.
    Retrying,
    /// Into `delayed` until the backoff elapses.
    Delayed { until: DateTime<Utc> },
    /// Terminal `failed`.
    Failed,
}

impl FailedTransition {
    pub fn state(&self) -> JobState {
        match self {
            FailedTransition::Retrying => JobState::Waiting,
            FailedTransition::Delayed { .. } => JobState::Delayed,
            FailedTransition::Failed => JobState::Failed,
        }
    }
}

/// Outcome of one stalled-jobs sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StalledReport {
    /// Jobs moved back to `waiting`.
    pub requeued: Vec<JobId>,
    /// Jobs that exceeded the stall limit, as stored after failing them.
    pub failed: Vec<Job>,
}

impl StalledReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }
}

/// Per-state job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Queue-wide fetch rate limit: at most `max` jobs per `duration` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max: u32,
    pub duration: Duration,
}

impl RateLimit {
    pub fn new(max: u32, duration: Duration) -> Self {
        Self { max, duration }
    }
}

/// Reason recorded on jobs failed by stalled recovery.
pub const STALLED_REASON: &str = "job stalled more than allowable limit";

/// Atomic job-state operations.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a job (producer side).
    async fn add(&self, name: &str, data: Value, opts: JobOptions) -> StoreResult<Job>;

    async fn get(&self, job_id: &JobId) -> StoreResult<Option<Job>>;

    /// Promote due delayed jobs, then move the next waiting job to `active`
    /// under `token` for `lock_duration`, incrementing its attempts.
    async fn fetch_next_job(&self, token: &LockToken, lock_duration: Duration) -> StoreResult<NextJob>;

    /// Renew the lock iff `token` still holds it.
    async fn extend_lock(&self, job_id: &JobId, token: &LockToken, lock_duration: Duration) -> StoreResult<()>;

    async fn mark_completed(&self, job_id: &JobId, token: &LockToken, result: Value) -> StoreResult<()>;

    /// Record a failed attempt and retry, delay or fail the job according to
    /// its options.
    async fn mark_failed(
        &self,
        job_id: &JobId,
        token: &LockToken,
        failure: &JobFailure,
    ) -> StoreResult<FailedTransition>;

    /// Defer an active job without consuming an attempt. Returns when it will
    /// be due.
    async fn move_to_delayed(
        &self,
        job_id: &JobId,
        token: &LockToken,
        delay: Duration,
    ) -> StoreResult<DateTime<Utc>>;

    /// Requeue active jobs whose lock expired; fail those that stalled more
    /// than `max_stalled_count` times.
    async fn recover_stalled(&self, max_stalled_count: u32) -> StoreResult<StalledReport>;

    async fn update_progress(&self, job_id: &JobId, progress: Value) -> StoreResult<()>;

    /// Append a log line. Returns the number of lines now stored.
    async fn add_log(&self, job_id: &JobId, line: String) -> StoreResult<usize>;

    /// Replace the job's payload.
    async fn update_data(&self, job_id: &JobId, data: Value) -> StoreResult<()>;

    async fn counts(&self) -> StoreResult<JobCounts>;

    /// Wait up to `timeout` for work to become available. Returns early when a
    /// job is added or a delayed job falls due; may return spuriously.
    async fn wait_for_work(&self, timeout: Duration) -> StoreResult<()>;

    /// Connectivity probe.
    async fn ready(&self) -> StoreResult<()>;
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn add(&self, name: &str, data: Value, opts: JobOptions) -> StoreResult<Job> {
        (**self).add(name, data, opts).await
    }

    async fn get(&self, job_id: &JobId) -> StoreResult<Option<Job>> {
        (**self).get(job_id).await
    }

    async fn fetch_next_job(&self, token: &LockToken, lock_duration: Duration) -> StoreResult<NextJob> {
        (**self).fetch_next_job(token, lock_duration).await
    }

    async fn extend_lock(&self, job_id: &JobId, token: &LockToken, lock_duration: Duration) -> StoreResult<()> {
        (**self).extend_lock(job_id, token, lock_duration).await
    }

    async fn mark_completed(&self, job_id: &JobId, token: &LockToken, result: Value) -> StoreResult<()> {
        (**self).mark_completed(job_id, token, result).await
    }

    async fn mark_failed(
        &self,
        job_id: &JobId,
        token: &LockToken,
        failure: &JobFailure,
    ) -> StoreResult<FailedTransition> {
        (**self).mark_failed(job_id, token, failure).await
    }

    async fn move_to_delayed(
        &self,
        job_id: &JobId,
        token: &LockToken,
        delay: Duration,
    ) -> StoreResult<DateTime<Utc>> {
        (**self).move_to_delayed(job_id, token, delay).await
    }

    async fn recover_stalled(&self, max_stalled_count: u32) -> StoreResult<StalledReport> {
        (**self).recover_stalled(max_stalled_count).await
    }

    async fn update_progress(&self, job_id: &JobId, progress: Value) -> StoreResult<()> {
        (**self).update_progress(job_id, progress).await
    }

    async fn add_log(&self, job_id: &JobId, line: String) -> StoreResult<usize> {
        (**self).add_log(job_id, line).await
    }

    async fn update_data(&self, job_id: &JobId, data: Value) -> StoreResult<()> {
        (**self).update_data(job_id, data).await
    }

    async fn counts(&self) -> StoreResult<JobCounts> {
        (**self).counts().await
    }

    async fn wait_for_work(&self, timeout: Duration) -> StoreResult<()> {
        (**self).wait_for_work(timeout).await
    }

    async fn ready(&self) -> StoreResult<()> {
        (**self).ready().await
    }
}
