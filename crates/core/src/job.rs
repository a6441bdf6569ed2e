//! Job record, options and retry policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult, JobFailure};
use crate::id::{JobId, LockToken};

/// Job lifecycle state.
///
/// `waiting -> active -> {completed | failed | delayed -> waiting}`; a stalled
/// active job goes back to `waiting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Ready to be picked up.
    Waiting,
    /// Scheduled for later reactivation.
    Delayed,
    /// Locked by a worker and executing.
    Active,
    /// Finished successfully.
    Completed,
    /// Finished with attempts exhausted or an unrecoverable error.
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry.
    Fixed,
    /// `delay * 2^(attempt - 1)`.
    Exponential,
}

/// Backoff policy applied before retrying a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(rename = "type")]
    pub strategy: BackoffStrategy,
    #[serde(with = "duration_ms")]
    pub delay: Duration,
    /// Optional cap for exponential growth.
    #[serde(default, with = "opt_duration_ms", skip_serializing_if = "Option::is_none")]
    pub max_delay: Option<Duration>,
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            delay,
            max_delay: None,
        }
    }

    pub fn exponential(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            delay,
            max_delay: None,
        }
    }

    pub fn with_max_delay(mut self, max: Duration) -> Self {
        self.max_delay = Some(max);
        self
    }

    /// Delay before the next attempt, given the attempts already made
    /// (1-indexed: the first failure passes `1`).
    pub fn delay_for_attempt(&self, attempts_made: u32) -> Duration {
        if attempts_made == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.delay,
            BackoffStrategy::Exponential => {
                let shift = (attempts_made - 1).min(63);
                let factor = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
                let ms = (self.delay.as_millis() as u64).saturating_mul(factor);
                Duration::from_millis(ms)
            }
        };

        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}

/// Options interpreted once, when a job is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Maximum number of attempts (>= 1).
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffPolicy>,
    /// Initial delay before the job becomes waiting.
    #[serde(default, with = "opt_duration_ms", skip_serializing_if = "Option::is_none")]
    pub delay: Option<Duration>,
    /// Producer-chosen id; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 1,
            backoff: None,
            delay: None,
            job_id: None,
        }
    }
}

impl JobOptions {
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_job_id(mut self, job_id: impl Into<JobId>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.attempts == 0 {
            return Err(CoreError::validation("attempts must be at least 1"));
        }
        Ok(())
    }
}

/// Lock held by one worker on an active job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLock {
    pub token: LockToken,
    pub expires_at: DateTime<Utc>,
}

impl JobLock {
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// What `mark_failed` does with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to `waiting` immediately.
    Retry,
    /// To `delayed` until the given instant.
    Delay(DateTime<Utc>),
    /// Terminal `failed`.
    Fail,
}

/// A unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    /// Opaque payload.
    pub data: serde_json::Value,
    pub opts: JobOptions,
    pub state: JobState,
    /// Attempts started so far (incremented on fetch).
    pub attempts_made: u32,
    /// How many times the job was recovered as stalled.
    pub stalled_counter: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<JobLock>,
    #[serde(default)]
    pub progress: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_on: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_on: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delayed_until: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a job as a producer would (`waiting`, or `delayed` when
    /// `opts.delay` is set).
    pub fn new(
        name: impl Into<String>,
        data: serde_json::Value,
        opts: JobOptions,
        now: DateTime<Utc>,
    ) -> CoreResult<Self> {
        opts.validate()?;

        let id = opts.job_id.clone().unwrap_or_default();
        let delayed_until = opts
            .delay
            .filter(|d| !d.is_zero())
            .map(|d| now + to_chrono(d));

        Ok(Self {
            id,
            name: name.into(),
            data,
            state: if delayed_until.is_some() {
                JobState::Delayed
            } else {
                JobState::Waiting
            },
            opts,
            attempts_made: 0,
            stalled_counter: 0,
            lock: None,
            progress: serde_json::Value::Null,
            return_value: None,
            failed_reason: None,
            logs: Vec::new(),
            created_at: now,
            processed_on: None,
            finished_on: None,
            delayed_until,
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.opts.attempts
    }

    /// Whether a delayed job is due.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.delayed_until {
            Some(at) => now >= at,
            None => true,
        }
    }

    /// Whether `token` currently owns this job.
    pub fn is_locked_by(&self, token: &LockToken, now: DateTime<Utc>) -> bool {
        self.lock
            .as_ref()
            .is_some_and(|l| &l.token == token && l.is_valid(now))
    }

    /// Decide where a failed attempt goes.
    pub fn retry_decision(&self, failure: &JobFailure, now: DateTime<Utc>) -> RetryDecision {
        if failure.is_unrecoverable() || self.attempts_made >= self.max_attempts() {
            return RetryDecision::Fail;
        }

        let delay = self
            .opts
            .backoff
            .map(|b| b.delay_for_attempt(self.attempts_made))
            .unwrap_or(Duration::ZERO);

        if delay.is_zero() {
            RetryDecision::Retry
        } else {
            RetryDecision::Delay(now + to_chrono(delay))
        }
    }
}

/// Convert a std duration to chrono, saturating on overflow.
pub fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod opt_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
