//! Running one job: executor, progress sink, lock heartbeat.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use taskmill_core::{FailureKind, Job, JobFailure, JobId, LockToken, ProcessorError};
use taskmill_events::{EventBus, InMemoryEventBus, WorkerEvent};

use crate::processor::{JobContext, Processor, ProgressSink};
use crate::sandbox::{SandboxError, SandboxPool};
use crate::store::JobStore;

/// How a tracked operation ended.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Outcome {
    Completed(Value),
    Failed(JobFailure),
    /// Job logic asked to run again later.
    Delayed(Duration),
    /// Execution was cut short (lock lost, forced close); nothing is reported.
    Abandoned(&'static str),
}

impl From<Result<Value, ProcessorError>> for Outcome {
    fn from(value: Result<Value, ProcessorError>) -> Self {
        match value {
            Ok(v) => Outcome::Completed(v),
            Err(ProcessorError::Failed(msg)) => Outcome::Failed(JobFailure::processor(msg)),
            Err(ProcessorError::Unrecoverable(msg)) => Outcome::Failed(JobFailure::unrecoverable(msg)),
            Err(ProcessorError::Delayed(delay)) => Outcome::Delayed(delay),
        }
    }
}

/// A settled tracked operation, ready to be reported.
#[derive(Debug)]
pub(crate) struct Completion {
    pub job: Arc<Job>,
    pub token: LockToken,
    pub outcome: Outcome,
    /// Concurrency slot taken when the job was fetched.
    pub slot: OwnedSemaphorePermit,
}

/// Where jobs run.
pub(crate) enum Executor {
    Inline(Arc<dyn Processor>),
    Sandboxed { pool: Arc<SandboxPool>, path: String },
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Executor {
    pub(crate) async fn execute(&self, job: &Arc<Job>, sink: Arc<dyn ProgressSink>) -> Outcome {
        match self {
            Executor::Inline(processor) => {
                let processor = processor.clone();
                let job = job.clone();
                let ctx = JobContext::new(sink);

                // Own task so a panic in job logic fails the job instead of
                // taking the tracked operation down with it.
                let mut task = AbortOnDrop(tokio::spawn(async move { processor.process(&job, &ctx).await }));
                match (&mut task.0).await {
                    Ok(result) => Outcome::from(result),
                    Err(join) if join.is_panic() => {
                        Outcome::Failed(JobFailure::processor(format!("processor panicked: {join}")))
                    }
                    Err(_) => Outcome::Abandoned("job task cancelled"),
                }
            }
            Executor::Sandboxed { pool, path } => match pool.run(path, job, sink.as_ref()).await {
                Ok(result) => Outcome::from(result),
                Err(SandboxError::Crash(msg)) => Outcome::Failed(JobFailure::crash(msg)),
                Err(other) => Outcome::Failed(JobFailure::new(FailureKind::Sandbox, other.to_string())),
            },
        }
    }
}

/// Routes job reports to the store and the event bus.
pub(crate) struct EngineSink {
    store: Arc<dyn JobStore>,
    events: Arc<InMemoryEventBus<WorkerEvent>>,
    job_id: JobId,
}

impl EngineSink {
    pub(crate) fn new(store: Arc<dyn JobStore>, events: Arc<InMemoryEventBus<WorkerEvent>>, job_id: JobId) -> Self {
        Self { store, events, job_id }
    }
}

#[async_trait]
impl ProgressSink for EngineSink {
    async fn progress(&self, value: Value) {
        if let Err(err) = self.store.update_progress(&self.job_id, value.clone()).await {
            warn!(job_id = %self.job_id, error = %err, "failed to store progress");
        }
        let event = WorkerEvent::Progress {
            job_id: self.job_id.clone(),
            progress: value,
        };
        if let Err(err) = self.events.publish(event) {
            warn!(job_id = %self.job_id, error = ?err, "failed to publish progress");
        }
    }

    async fn log(&self, line: String) {
        if let Err(err) = self.store.add_log(&self.job_id, line).await {
            warn!(job_id = %self.job_id, error = %err, "failed to store job log");
        }
    }

    async fn update(&self, data: Value) {
        if let Err(err) = self.store.update_data(&self.job_id, data).await {
            warn!(job_id = %self.job_id, error = %err, "failed to update job data");
        }
    }
}

/// Inputs of a lock heartbeat.
pub(crate) struct Heartbeat {
    pub store: Arc<dyn JobStore>,
    pub job_id: JobId,
    pub token: LockToken,
    pub lock_duration: Duration,
    pub renew_margin: Duration,
    /// Cancelled when the lock is known lost.
    pub lost: CancellationToken,
    /// Cancelled by the owner once the job is done.
    pub stop: CancellationToken,
}

impl Heartbeat {
    /// Renew the lock `renew_margin` before it expires until stopped.
    ///
    /// Transient store errors are retried. Cancels `lost` on any other
    /// error (token rejected, job gone) or when the expiry passes without a
    /// successful renewal.
    pub(crate) async fn run(self) {
        let period = self.lock_duration.saturating_sub(self.renew_margin);
        let retry = (self.renew_margin / 4).max(Duration::from_millis(50));

        let mut expires = Instant::now() + self.lock_duration;
        let mut next_renewal = Instant::now() + period;

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return,
                _ = tokio::time::sleep_until(next_renewal.min(expires)) => {}
            }

            if Instant::now() >= expires {
                warn!(job_id = %self.job_id, "lock expired before it could be renewed");
                self.lost.cancel();
                return;
            }

            let renewal = tokio::time::timeout(
                self.renew_margin,
                self.store.extend_lock(&self.job_id, &self.token, self.lock_duration),
            )
            .await;

            match renewal {
                Ok(Ok(())) => {
                    debug!(job_id = %self.job_id, "lock renewed");
                    let now = Instant::now();
                    expires = now + self.lock_duration;
                    next_renewal = now + period;
                }
                Ok(Err(err)) if err.is_transient() => {
                    warn!(job_id = %self.job_id, error = %err, "lock renewal failed");
                    next_renewal = Instant::now() + retry;
                }
                Ok(Err(err)) => {
                    warn!(job_id = %self.job_id, error = %err, "lock lost");
                    self.lost.cancel();
                    return;
                }
                Err(_) => {
                    warn!(job_id = %self.job_id, "lock renewal timed out");
                    next_renewal = Instant::now() + retry;
                }
            }
        }
    }
}
