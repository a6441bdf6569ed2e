//! In-process job store for tests, demos and single-process deployments.
//!
//! All state sits behind one mutex, so each trait call is trivially atomic.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, instrument};

use taskmill_core::{
    FailureKind, Job, JobFailure, JobId, JobLock, JobOptions, JobState, LockToken, RetryDecision, to_chrono,
};

use super::{
    FailedTransition, JobCounts, JobStore, NextJob, RateLimit, STALLED_REASON, StalledReport, StoreError,
    StoreResult,
};

#[derive(Debug)]
struct Window {
    started: DateTime<Utc>,
    used: u32,
}

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    waiting: VecDeque<JobId>,
    delayed: BTreeSet<(DateTime<Utc>, JobId)>,
    active: BTreeSet<JobId>,
    window: Option<Window>,
}

impl State {
    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some((at, _)) = self.delayed.first() {
            if *at > now {
                break;
            }
            let Some((_, id)) = self.delayed.pop_first() else {
                break;
            };
            if let Some(job) = self.jobs.get_mut(&id) {
                job.state = JobState::Waiting;
                job.delayed_until = None;
                self.waiting.push_back(id);
            }
        }
    }

    /// Remaining window time if the limiter is saturated.
    fn limited_for(&mut self, limit: &RateLimit, now: DateTime<Utc>) -> Option<Duration> {
        let window_len = to_chrono(limit.duration);
        if self
            .window
            .as_ref()
            .is_some_and(|w| now >= w.started + window_len)
        {
            self.window = None;
        }

        match &self.window {
            Some(w) if w.used >= limit.max => (w.started + window_len - now).to_std().ok(),
            _ => None,
        }
    }

    fn count_fetch(&mut self, now: DateTime<Utc>) {
        match &mut self.window {
            Some(w) => w.used += 1,
            None => {
                self.window = Some(Window {
                    started: now,
                    used: 1,
                })
            }
        }
    }

    /// The job, if `token` currently owns it.
    fn owned(&mut self, job_id: &JobId, token: &LockToken, now: DateTime<Utc>) -> StoreResult<&mut Job> {
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::NotFound(job_id.clone()))?;
        if job.state != JobState::Active || !job.is_locked_by(token, now) {
            return Err(StoreError::LockMismatch(job_id.clone()));
        }
        Ok(job)
    }

    fn existing(&mut self, job_id: &JobId) -> StoreResult<&mut Job> {
        self.jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::NotFound(job_id.clone()))
    }
}

/// In-memory [`JobStore`].
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: Mutex<State>,
    work: Notify,
    rate_limit: Option<RateLimit>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn with_rate_limit(mut self, limit: RateLimit) -> Self {
        self.rate_limit = Some(limit);
        self
    }

    fn state(&self) -> StoreResult<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    #[instrument(skip(self, data, opts))]
    async fn add(&self, name: &str, data: Value, opts: JobOptions) -> StoreResult<Job> {
        let now = Utc::now();
        let job = Job::new(name, data, opts, now)?;

        {
            let mut state = self.state()?;
            if state.jobs.contains_key(&job.id) {
                return Err(StoreError::AlreadyExists(job.id));
            }
            match job.delayed_until {
                Some(at) => {
                    state.delayed.insert((at, job.id.clone()));
                }
                None => state.waiting.push_back(job.id.clone()),
            }
            state.jobs.insert(job.id.clone(), job.clone());
        }

        debug!(job_id = %job.id, state = %job.state, "job added");
        self.work.notify_waiters();
        Ok(job)
    }

    async fn get(&self, job_id: &JobId) -> StoreResult<Option<Job>> {
        Ok(self.state()?.jobs.get(job_id).cloned())
    }

    #[instrument(skip(self, token), fields(token = %token))]
    async fn fetch_next_job(&self, token: &LockToken, lock_duration: Duration) -> StoreResult<NextJob> {
        let now = Utc::now();
        let mut state = self.state()?;

        state.promote_due(now);

        if let Some(limit) = &self.rate_limit {
            if let Some(retry_after) = state.limited_for(limit, now) {
                return Ok(NextJob::RateLimited { retry_after });
            }
        }

        while let Some(id) = state.waiting.pop_front() {
            let Some(job) = state.jobs.get_mut(&id) else {
                continue;
            };

            job.state = JobState::Active;
            job.attempts_made += 1;
            job.processed_on = Some(now);
            job.lock = Some(JobLock {
                token: token.clone(),
                expires_at: now + to_chrono(lock_duration),
            });
            let snapshot = job.clone();

            state.active.insert(id);
            if self.rate_limit.is_some() {
                state.count_fetch(now);
            }
            return Ok(NextJob::Job(Box::new(snapshot)));
        }

        Ok(NextJob::Empty)
    }

    async fn extend_lock(&self, job_id: &JobId, token: &LockToken, lock_duration: Duration) -> StoreResult<()> {
        let now = Utc::now();
        let mut state = self.state()?;
        let job = state.owned(job_id, token, now)?;
        job.lock = Some(JobLock {
            token: token.clone(),
            expires_at: now + to_chrono(lock_duration),
        });
        Ok(())
    }

    #[instrument(skip(self, job_id, result), fields(job_id = %job_id))]
    async fn mark_completed(&self, job_id: &JobId, token: &LockToken, result: Value) -> StoreResult<()> {
        let now = Utc::now();
        let mut state = self.state()?;
        let job = state.owned(job_id, token, now)?;

        job.state = JobState::Completed;
        job.lock = None;
        job.return_value = Some(result);
        job.finished_on = Some(now);

        state.active.remove(job_id);
        Ok(())
    }

    #[instrument(skip(self, job_id, failure), fields(job_id = %job_id, kind = ?failure.kind))]
    async fn mark_failed(
        &self,
        job_id: &JobId,
        token: &LockToken,
        failure: &JobFailure,
    ) -> StoreResult<FailedTransition> {
        let now = Utc::now();
        let transition = {
            let mut state = self.state()?;
            let job = state.owned(job_id, token, now)?;

            job.lock = None;
            job.failed_reason = Some(failure.message.clone());

            let transition = match job.retry_decision(failure, now) {
                RetryDecision::Retry => {
                    job.state = JobState::Waiting;
                    FailedTransition::Retrying
                }
                RetryDecision::Delay(until) => {
                    job.state = JobState::Delayed;
                    job.delayed_until = Some(until);
                    FailedTransition::Delayed { until }
                }
                RetryDecision::Fail => {
                    job.state = JobState::Failed;
                    job.finished_on = Some(now);
                    FailedTransition::Failed
                }
            };

            state.active.remove(job_id);
            match transition {
                FailedTransition::Retrying => state.waiting.push_back(job_id.clone()),
                FailedTransition::Delayed { until } => {
                    state.delayed.insert((until, job_id.clone()));
                }
                FailedTransition::Failed => {}
            }
            transition
        };

        if transition == FailedTransition::Retrying {
            self.work.notify_waiters();
        }
        Ok(transition)
    }

    async fn move_to_delayed(
        &self,
        job_id: &JobId,
        token: &LockToken,
        delay: Duration,
    ) -> StoreResult<DateTime<Utc>> {
        let now = Utc::now();
        let until = now + to_chrono(delay);

        let mut state = self.state()?;
        let job = state.owned(job_id, token, now)?;
        job.lock = None;
        job.state = JobState::Delayed;
        job.delayed_until = Some(until);
        job.attempts_made = job.attempts_made.saturating_sub(1);

        state.active.remove(job_id);
        state.delayed.insert((until, job_id.clone()));
        Ok(until)
    }

    #[instrument(skip(self))]
    async fn recover_stalled(&self, max_stalled_count: u32) -> StoreResult<StalledReport> {
        let now = Utc::now();
        let mut report = StalledReport::default();

        {
            let mut state = self.state()?;
            let stalled: Vec<JobId> = state
                .active
                .iter()
                .filter(|id| {
                    state
                        .jobs
                        .get(*id)
                        .is_none_or(|job| job.lock.as_ref().is_none_or(|l| !l.is_valid(now)))
                })
                .cloned()
                .collect();

            for id in stalled {
                state.active.remove(&id);
                let Some(job) = state.jobs.get_mut(&id) else {
                    continue;
                };

                job.lock = None;
                job.stalled_counter += 1;

                if job.stalled_counter > max_stalled_count {
                    let failure = JobFailure::new(FailureKind::Stalled, STALLED_REASON);
                    job.state = JobState::Failed;
                    job.failed_reason = Some(failure.message);
                    job.finished_on = Some(now);
                    report.failed.push(job.clone());
                } else {
                    job.state = JobState::Waiting;
                    job.attempts_made = job.attempts_made.saturating_sub(1);
                    state.waiting.push_back(id.clone());
                    report.requeued.push(id);
                }
            }
        }

        if !report.requeued.is_empty() {
            self.work.notify_waiters();
        }
        Ok(report)
    }

    async fn update_progress(&self, job_id: &JobId, progress: Value) -> StoreResult<()> {
        self.state()?.existing(job_id)?.progress = progress;
        Ok(())
    }

    async fn add_log(&self, job_id: &JobId, line: String) -> StoreResult<usize> {
        let mut state = self.state()?;
        let job = state.existing(job_id)?;
        job.logs.push(line);
        Ok(job.logs.len())
    }

    async fn update_data(&self, job_id: &JobId, data: Value) -> StoreResult<()> {
        self.state()?.existing(job_id)?.data = data;
        Ok(())
    }

    async fn counts(&self) -> StoreResult<JobCounts> {
        let state = self.state()?;
        let mut counts = JobCounts {
            waiting: state.waiting.len(),
            delayed: state.delayed.len(),
            active: state.active.len(),
            ..JobCounts::default()
        };
        for job in state.jobs.values() {
            match job.state {
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
                _ => {}
            }
        }
        Ok(counts)
    }

    async fn wait_for_work(&self, timeout: Duration) -> StoreResult<()> {
        let notified = self.work.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let wait = {
            let state = self.state()?;
            if !state.waiting.is_empty() {
                return Ok(());
            }
            let now = Utc::now();
            match state.delayed.first() {
                Some((at, _)) if *at <= now => return Ok(()),
                Some((at, _)) => timeout.min((*at - now).to_std().unwrap_or(Duration::ZERO)),
                None => timeout,
            }
        };

        let _ = tokio::time::timeout(wait, notified).await;
        Ok(())
    }

    async fn ready(&self) -> StoreResult<()> {
        self.state().map(|_| ())
    }
}
