//! Controller loop, reporter, tracked operations and worker lifecycle.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use taskmill_core::{BackoffPolicy, FailureKind, Job, JobFailure, JobState, LockToken, WorkerId};
use taskmill_events::{EventBus, InMemoryEventBus, Subscription, WorkerEvent};

use crate::processor::Processor;
use crate::sandbox::{ProcessorRegistry, SandboxKind, SandboxPool};
use crate::sequencer::CompletionSequencer;
use crate::store::{JobStore, NextJob, STALLED_REASON, StoreError};
use crate::worker::execution::{Completion, EngineSink, Executor, Heartbeat, Outcome};
use crate::worker::{WorkerConfig, WorkerError};

const FETCH_RETRY_BASE: Duration = Duration::from_millis(100);
const FETCH_RETRY_MAX: Duration = Duration::from_secs(5);
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// State shared by the controller, the reporter, tracked operations and the
/// handle.
struct Shared {
    id: WorkerId,
    config: WorkerConfig,
    store: Arc<dyn JobStore>,
    executor: Executor,
    pool: Option<Arc<SandboxPool>>,
    events: Arc<InMemoryEventBus<WorkerEvent>>,
    sequencer: CompletionSequencer<Completion, WorkerError>,
    /// One permit per job executing or awaiting its report.
    slots: Arc<Semaphore>,
    /// Wakes the reporter when a job is registered.
    registered: Notify,
    next_lock: AtomicU64,
    /// Stop fetching.
    closing: CancellationToken,
    /// Set by the controller once it will register nothing more.
    fetch_stopped: CancellationToken,
    /// Abandon in-flight executions.
    abort: CancellationToken,
}

impl Shared {
    fn emit(&self, event: WorkerEvent) {
        trace!(event = event.kind().as_str(), job_id = ?event.job_id(), "worker event");
        if let Err(err) = self.events.publish(event) {
            warn!(worker = %self.config.name, error = ?err, "failed to publish worker event");
        }
    }

    fn next_token(&self) -> LockToken {
        LockToken::new(self.id, self.next_lock.fetch_add(1, Ordering::Relaxed))
    }

    /// Write a settled outcome back to the store.
    #[instrument(skip_all, fields(job_id = %completion.job.id))]
    async fn report(&self, completion: Completion) {
        let Completion {
            job,
            token,
            outcome,
            slot,
        } = completion;

        let reported = match outcome {
            Outcome::Completed(value) => {
                let res = self.store.mark_completed(&job.id, &token, value.clone()).await;
                res.map(|()| {
                    info!("job completed");
                    self.emit(WorkerEvent::Completed {
                        job: job.clone(),
                        result: value,
                    });
                })
            }
            Outcome::Failed(failure) => {
                let res = self.store.mark_failed(&job.id, &token, &failure).await;
                res.map(|transition| {
                    let next = transition.state();
                    warn!(error = %failure, next = %next, "job attempt failed");
                    self.emit(WorkerEvent::Failed {
                        job: job.clone(),
                        failure,
                        next,
                    });
                })
            }
            Outcome::Delayed(delay) => {
                let res = self.store.move_to_delayed(&job.id, &token, delay).await;
                res.map(|until| info!(until = %until, "job delayed by processor"))
            }
            Outcome::Abandoned(reason) => {
                warn!(reason, "execution abandoned; job left active");
                Ok(())
            }
        };

        match reported {
            Ok(()) => {}
            Err(StoreError::LockMismatch(_)) => {
                debug!("job no longer locked by this worker; result discarded");
            }
            Err(err) => {
                error!(error = %err, "failed to report job outcome");
                self.emit(WorkerEvent::error(format!("failed to report job {}: {err}", job.id)));
            }
        }

        // The next fetch may only start once this job is off the books.
        drop(slot);
    }
}

/// Heartbeat, execution and result mapping for one fetched job.
async fn track(
    shared: Arc<Shared>,
    job: Arc<Job>,
    token: LockToken,
    slot: OwnedSemaphorePermit,
) -> Result<Completion, WorkerError> {
    shared.emit(WorkerEvent::Active {
        job: job.clone(),
        prev: JobState::Waiting,
    });

    let lost = CancellationToken::new();
    let stop = CancellationToken::new();
    let heartbeat = tokio::spawn(
        Heartbeat {
            store: shared.store.clone(),
            job_id: job.id.clone(),
            token: token.clone(),
            lock_duration: shared.config.lock_duration,
            renew_margin: shared.config.lock_renew_margin,
            lost: lost.clone(),
            stop: stop.clone(),
        }
        .run(),
    );

    let sink = Arc::new(EngineSink::new(shared.store.clone(), shared.events.clone(), job.id.clone()));
    let outcome = tokio::select! {
        biased;
        _ = shared.abort.cancelled() => Outcome::Abandoned("worker closed"),
        _ = lost.cancelled() => Outcome::Abandoned("lock lost"),
        outcome = shared.executor.execute(&job, sink) => outcome,
    };

    // No renewal may follow the outcome being reported.
    stop.cancel();
    heartbeat.await?;

    Ok(Completion {
        job,
        token,
        outcome,
        slot,
    })
}

#[derive(Debug, Clone, Copy)]
enum Wait {
    /// The queue is empty.
    Work,
    /// Rate limited or backing off after a fetch error.
    Sleep(Duration),
}

/// Fetch loop: take a slot, fetch a job, register it. Reporting happens in
/// [`report_outcomes`], so a slow store write never holds up the next fetch.
async fn control(shared: Arc<Shared>) {
    let retry = BackoffPolicy::exponential(FETCH_RETRY_BASE).with_max_delay(FETCH_RETRY_MAX);
    let mut fetch_failures: u32 = 0;
    let mut drained = false;

    loop {
        let slot = tokio::select! {
            biased;
            _ = shared.closing.cancelled() => break,
            slot = shared.slots.clone().acquire_owned() => match slot {
                Ok(slot) => slot,
                Err(_) => break,
            },
        };

        let token = shared.next_token();
        let wait = match shared.store.fetch_next_job(&token, shared.config.lock_duration).await {
            Ok(NextJob::Job(job)) => {
                fetch_failures = 0;
                drained = false;
                let job: Arc<Job> = Arc::from(job);
                debug!(job_id = %job.id, token = %token, attempt = job.attempts_made, "job fetched");
                shared.sequencer.register(track(shared.clone(), job, token, slot));
                shared.registered.notify_one();
                continue;
            }
            Ok(NextJob::Empty) => {
                fetch_failures = 0;
                if !drained {
                    drained = true;
                    debug!(worker = %shared.config.name, "queue drained");
                    shared.emit(WorkerEvent::Drained);
                }
                Wait::Work
            }
            Ok(NextJob::RateLimited { retry_after }) => {
                fetch_failures = 0;
                debug!(retry_after_ms = retry_after.as_millis() as u64, "rate limited");
                Wait::Sleep(retry_after)
            }
            Err(err) => {
                fetch_failures = fetch_failures.saturating_add(1);
                let delay = retry.delay_for_attempt(fetch_failures);
                warn!(error = %err, retry_in_ms = delay.as_millis() as u64, "failed to fetch next job");
                shared.emit(WorkerEvent::error(format!("failed to fetch next job: {err}")));
                Wait::Sleep(delay)
            }
        };
        drop(slot);

        let idle = async {
            match wait {
                Wait::Work => {
                    if let Err(err) = shared.store.wait_for_work(shared.config.drain_interval).await {
                        warn!(error = %err, "waiting for work failed");
                        tokio::time::sleep(FETCH_RETRY_BASE).await;
                    }
                }
                Wait::Sleep(delay) => tokio::time::sleep(delay).await,
            }
        };

        tokio::select! {
            biased;
            _ = shared.closing.cancelled() => break,
            _ = idle => {}
        }
    }

    shared.fetch_stopped.cancel();
    debug!(worker = %shared.config.name, "controller stopped");
}

/// Report settled jobs in the order they finish until the controller has
/// stopped and nothing is left in flight.
async fn report_outcomes(shared: Arc<Shared>) {
    loop {
        if shared.sequencer.count_total() == 0 {
            if shared.fetch_stopped.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = shared.registered.notified() => {}
                _ = shared.fetch_stopped.cancelled() => {}
            }
            continue;
        }

        match shared.sequencer.fetch().await {
            Ok(Some(completion)) => shared.report(completion).await,
            Ok(None) => {}
            Err(err) => {
                error!(error = %err, "tracked job operation failed");
                shared.emit(WorkerEvent::error(err.to_string()));
            }
        }
    }

    debug!(worker = %shared.config.name, "reporter stopped");
}

async fn check_stalled(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(shared.config.stalled_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shared.closing.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match shared.store.recover_stalled(shared.config.max_stalled_count).await {
            Ok(report) => {
                for job_id in report.requeued {
                    warn!(job_id = %job_id, "stalled job moved back to waiting");
                    shared.emit(WorkerEvent::Stalled { job_id });
                }
                for job in report.failed {
                    warn!(job_id = %job.id, "stalled job failed");
                    shared.emit(WorkerEvent::Failed {
                        job: Arc::new(job),
                        failure: JobFailure::new(FailureKind::Stalled, STALLED_REASON),
                        next: JobState::Failed,
                    });
                }
            }
            Err(err) => {
                warn!(error = %err, "stalled job check failed");
                shared.emit(WorkerEvent::error(format!("failed to check stalled jobs: {err}")));
            }
        }
    }
}

struct Tasks {
    controller: JoinHandle<()>,
    reporter: JoinHandle<()>,
    stalled: JoinHandle<()>,
}

/// Wait for a background task, aborting it after [`TASK_STOP_TIMEOUT`].
async fn join_or_abort(name: &str, mut task: JoinHandle<()>, worker: &str) {
    if tokio::time::timeout(TASK_STOP_TIMEOUT, &mut task).await.is_err() {
        warn!(worker, task = name, "task did not stop in time");
        task.abort();
    }
}

/// Handle to a running (or startable) worker.
///
/// ```ignore
/// let worker = Worker::builder(store)
///     .config(WorkerConfig::default().with_concurrency(4))
///     .processor(processor_fn(|job, _ctx| async move { Ok(job.data) }))
///     .build()?;
///
/// let mut events = worker.subscribe();
/// // ...
/// worker.close(false).await;
/// ```
pub struct Worker {
    shared: Arc<Shared>,
    tasks: Mutex<Option<Tasks>>,
    started: AtomicBool,
    closing_started: AtomicBool,
    closed: watch::Sender<bool>,
}

impl Worker {
    pub fn builder(store: Arc<dyn JobStore>) -> WorkerBuilder {
        WorkerBuilder {
            store,
            config: WorkerConfig::default(),
            processor: None,
            registry: None,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.shared.config
    }

    /// Sandbox pool, when jobs run isolated.
    pub fn pool(&self) -> Option<&Arc<SandboxPool>> {
        self.shared.pool.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.shared.closing.is_cancelled()
    }

    /// Jobs currently executing or awaiting their report.
    pub fn in_flight(&self) -> usize {
        self.shared.config.concurrency.saturating_sub(self.shared.slots.available_permits())
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> Subscription<WorkerEvent> {
        self.shared.events.subscribe()
    }

    /// Resolve once the store answers.
    pub async fn wait_until_ready(&self) -> Result<(), WorkerError> {
        self.shared.store.ready().await?;
        Ok(())
    }

    /// Spawn the controller, the reporter and the stalled-job checker;
    /// returns immediately.
    pub fn start(&self) -> Result<(), WorkerError> {
        if self.closing_started.load(Ordering::SeqCst) {
            return Err(WorkerError::Closed);
        }
        let handle = Handle::try_current().map_err(|_| WorkerError::NoRuntime)?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(WorkerError::AlreadyRunning);
        }

        let controller = handle.spawn(control(self.shared.clone()));
        let reporter = handle.spawn(report_outcomes(self.shared.clone()));
        let stalled = handle.spawn(check_stalled(self.shared.clone()));
        match self.tasks.lock() {
            Ok(mut tasks) => {
                *tasks = Some(Tasks {
                    controller,
                    reporter,
                    stalled,
                })
            }
            Err(_) => {
                controller.abort();
                reporter.abort();
                stalled.abort();
                return Err(WorkerError::Task("worker task table poisoned".into()));
            }
        }

        info!(
            worker = %self.shared.config.name,
            worker_id = %self.shared.id,
            concurrency = self.shared.config.concurrency,
            isolated = self.shared.pool.is_some(),
            "worker started"
        );
        Ok(())
    }

    /// Start if needed, then wait until the worker is closed.
    pub async fn run(&self) -> Result<(), WorkerError> {
        match self.start() {
            Ok(()) | Err(WorkerError::AlreadyRunning) => {}
            Err(err) => return Err(err),
        }
        self.wait_closed().await;
        Ok(())
    }

    async fn wait_closed(&self) {
        let mut closed = self.closed.subscribe();
        // The sender lives in `self`, so this only ends once `closed` is set.
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Stop fetching and shut down.
    ///
    /// Without `force`, in-flight jobs get `close_grace_period` to finish and
    /// be reported. Whatever is still running afterwards (or immediately,
    /// with `force`) is abandoned: sandbox contexts are killed and the jobs
    /// stay `active` until stalled recovery picks them up. Concurrent calls
    /// wait for the first one.
    pub async fn close(&self, force: bool) {
        if self.closing_started.swap(true, Ordering::SeqCst) {
            self.wait_closed().await;
            return;
        }

        let reason = if force { "forced close" } else { "close requested" };
        info!(worker = %self.shared.config.name, force, "worker closing");
        self.shared.emit(WorkerEvent::Closing { reason: reason.into() });
        self.shared.closing.cancel();

        if force {
            self.shared.abort.cancel();
        } else if tokio::time::timeout(self.shared.config.close_grace_period, self.shared.sequencer.wait_all())
            .await
            .is_err()
        {
            warn!(
                in_flight = self.shared.sequencer.count_pending(),
                "grace period elapsed; abandoning in-flight jobs"
            );
            self.shared.abort.cancel();
        }

        let tasks = self.tasks.lock().ok().and_then(|mut tasks| tasks.take());
        if let Some(Tasks {
            controller,
            reporter,
            stalled,
        }) = tasks
        {
            stalled.abort();
            let name = &self.shared.config.name;
            join_or_abort("controller", controller, name).await;
            // The reporter only exits once the controller has.
            self.shared.fetch_stopped.cancel();
            join_or_abort("reporter", reporter, name).await;
        }
        self.shared.abort.cancel();

        if let Some(pool) = &self.shared.pool {
            let killed = pool.clean().await;
            debug!(contexts = killed.len(), "sandbox pool cleaned");
        }

        self.shared.emit(WorkerEvent::Closed);
        self.closed.send_replace(true);
        info!(worker = %self.shared.config.name, "worker closed");
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shared.closing.cancel();
        self.shared.abort.cancel();
    }
}

impl core::fmt::Debug for Worker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.shared.id)
            .field("name", &self.shared.config.name)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Builder returned by [`Worker::builder`].
pub struct WorkerBuilder {
    store: Arc<dyn JobStore>,
    config: WorkerConfig,
    processor: Option<Arc<dyn Processor>>,
    registry: Option<Arc<ProcessorRegistry>>,
}

impl WorkerBuilder {
    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Job logic for inline execution.
    pub fn processor(self, processor: impl Processor + 'static) -> Self {
        self.processor_arc(Arc::new(processor))
    }

    pub fn processor_arc(mut self, processor: Arc<dyn Processor>) -> Self {
        self.processor = Some(processor);
        self
    }

    /// Processors served by thread sandboxes.
    pub fn registry(mut self, registry: Arc<ProcessorRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Validate the configuration, resolve the processor and, with
    /// `autorun`, start the worker.
    pub fn build(self) -> Result<Worker, WorkerError> {
        let config = self.config;
        config.validate()?;

        let (executor, pool) = if config.use_isolated_execution {
            let path = config
                .processor_path
                .clone()
                .ok_or_else(|| WorkerError::ProcessorLoad("isolated execution requires a processor_path".into()))?;

            let mut pool = SandboxPool::new(config.sandbox_kind).with_handshake_timeout(config.handshake_timeout);
            match config.sandbox_kind {
                SandboxKind::Process => {
                    if !Path::new(&path).is_file() {
                        return Err(WorkerError::ProcessorLoad(format!(
                            "processor executable not found: {path}"
                        )));
                    }
                }
                SandboxKind::Thread => {
                    let registry = self
                        .registry
                        .ok_or_else(|| WorkerError::ProcessorLoad("thread sandboxes require a registry".into()))?;
                    if !registry.contains(&path) {
                        return Err(WorkerError::ProcessorLoad(format!("no processor registered as {path}")));
                    }
                    pool = pool.with_registry(registry);
                }
            }

            let pool = Arc::new(pool);
            (Executor::Sandboxed { pool: pool.clone(), path }, Some(pool))
        } else {
            let processor = self
                .processor
                .ok_or_else(|| WorkerError::ProcessorLoad("no processor provided".into()))?;
            (Executor::Inline(processor), None)
        };

        let autorun = config.autorun;
        let slots = Arc::new(Semaphore::new(config.concurrency));
        let (closed, _) = watch::channel(false);
        let worker = Worker {
            shared: Arc::new(Shared {
                id: WorkerId::new(),
                config,
                store: self.store,
                executor,
                pool,
                events: Arc::new(InMemoryEventBus::new()),
                sequencer: CompletionSequencer::new(),
                slots,
                registered: Notify::new(),
                next_lock: AtomicU64::new(1),
                closing: CancellationToken::new(),
                fetch_stopped: CancellationToken::new(),
                abort: CancellationToken::new(),
            }),
            tasks: Mutex::new(None),
            started: AtomicBool::new(false),
            closing_started: AtomicBool::new(false),
            closed,
        };

        if autorun {
            worker.start()?;
        }
        Ok(worker)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::{Value, json};
    use tokio::sync::Barrier;

    use taskmill_core::{JobId, JobOptions, ProcessorError};

    use super::*;
    use crate::processor::{JobContext, processor_fn};
    use crate::store::{FailedTransition, InMemoryJobStore, JobCounts, StalledReport, StoreResult};

    /// In-memory store whose lock renewals and completion reports can be
    /// scripted.
    #[derive(Default)]
    struct ScriptedStore {
        inner: InMemoryJobStore,
        fail_renewals: bool,
        /// Completion reports answer as if another worker held the lock.
        reject_completions: bool,
        /// Completion reports wait for a permit when set.
        gate: Option<Semaphore>,
        reporting: Notify,
        completions: AtomicUsize,
    }

    #[async_trait]
    impl JobStore for ScriptedStore {
        async fn add(&self, name: &str, data: Value, opts: JobOptions) -> StoreResult<Job> {
            self.inner.add(name, data, opts).await
        }

        async fn get(&self, job_id: &JobId) -> StoreResult<Option<Job>> {
            self.inner.get(job_id).await
        }

        async fn fetch_next_job(&self, token: &LockToken, lock_duration: Duration) -> StoreResult<NextJob> {
            self.inner.fetch_next_job(token, lock_duration).await
        }

        async fn extend_lock(&self, job_id: &JobId, token: &LockToken, lock_duration: Duration) -> StoreResult<()> {
            if self.fail_renewals {
                return Err(StoreError::Communication("connection reset".into()));
            }
            self.inner.extend_lock(job_id, token, lock_duration).await
        }

        async fn mark_completed(&self, job_id: &JobId, token: &LockToken, result: Value) -> StoreResult<()> {
            self.completions.fetch_add(1, Ordering::SeqCst);
            self.reporting.notify_one();
            if let Some(gate) = &self.gate {
                let _open = gate
                    .acquire()
                    .await
                    .map_err(|_| StoreError::Communication("gate closed".into()))?;
            }
            if self.reject_completions {
                return Err(StoreError::LockMismatch(job_id.clone()));
            }
            self.inner.mark_completed(job_id, token, result).await
        }

        async fn mark_failed(
            &self,
            job_id: &JobId,
            token: &LockToken,
            failure: &JobFailure,
        ) -> StoreResult<FailedTransition> {
            self.inner.mark_failed(job_id, token, failure).await
        }

        async fn move_to_delayed(
            &self,
            job_id: &JobId,
            token: &LockToken,
            delay: Duration,
        ) -> StoreResult<DateTime<Utc>> {
            self.inner.move_to_delayed(job_id, token, delay).await
        }

        async fn recover_stalled(&self, max_stalled_count: u32) -> StoreResult<StalledReport> {
            self.inner.recover_stalled(max_stalled_count).await
        }

        async fn update_progress(&self, job_id: &JobId, progress: Value) -> StoreResult<()> {
            self.inner.update_progress(job_id, progress).await
        }

        async fn add_log(&self, job_id: &JobId, line: String) -> StoreResult<usize> {
            self.inner.add_log(job_id, line).await
        }

        async fn update_data(&self, job_id: &JobId, data: Value) -> StoreResult<()> {
            self.inner.update_data(job_id, data).await
        }

        async fn counts(&self) -> StoreResult<JobCounts> {
            self.inner.counts().await
        }

        async fn wait_for_work(&self, timeout: Duration) -> StoreResult<()> {
            self.inner.wait_for_work(timeout).await
        }

        async fn ready(&self) -> StoreResult<()> {
            self.inner.ready().await
        }
    }

    fn config() -> WorkerConfig {
        WorkerConfig::default()
            .with_autorun(false)
            .with_drain_interval(Duration::from_millis(50))
            .with_close_grace_period(Duration::from_secs(2))
    }

    async fn next_event(
        events: &mut Subscription<WorkerEvent>,
        matches: impl Fn(&WorkerEvent) -> bool,
    ) -> WorkerEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Some(event) if matches(&event) => return event,
                    Some(_) => continue,
                    None => panic!("event bus dropped"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn inline_jobs_complete_with_their_result() {
        let store = InMemoryJobStore::arc();
        let job = store.add("double", json!({ "n": 21 }), JobOptions::default()).await.unwrap();

        let worker = Worker::builder(store.clone())
            .config(config())
            .processor(processor_fn(|job: Job, ctx: JobContext| async move {
                ctx.progress(50).await;
                Ok(json!(job.data["n"].as_i64().unwrap_or(0) * 2))
            }))
            .build()
            .unwrap();
        let mut events = worker.subscribe();
        worker.start().unwrap();

        let event = next_event(&mut events, |e| matches!(e, WorkerEvent::Completed { .. })).await;
        match event {
            WorkerEvent::Completed { job: done, result } => {
                assert_eq!(done.id, job.id);
                assert_eq!(result, json!(42));
            }
            other => panic!("unexpected {other:?}"),
        }

        let stored = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.return_value, Some(json!(42)));
        assert_eq!(stored.progress, json!(50));

        worker.close(false).await;
    }

    #[tokio::test]
    async fn runs_up_to_concurrency_jobs_at_once() {
        let store = InMemoryJobStore::arc();
        for i in 0..3 {
            store.add("meet", json!(i), JobOptions::default()).await.unwrap();
        }

        // Only passes if all three jobs are executing together.
        let barrier = Arc::new(Barrier::new(3));
        let worker = Worker::builder(store.clone())
            .config(config().with_concurrency(3))
            .processor(processor_fn(move |_job: Job, _ctx: JobContext| {
                let barrier = barrier.clone();
                async move {
                    barrier.wait().await;
                    Ok(Value::Null)
                }
            }))
            .build()
            .unwrap();
        let mut events = worker.subscribe();
        worker.start().unwrap();

        for _ in 0..3 {
            next_event(&mut events, |e| matches!(e, WorkerEvent::Completed { .. })).await;
        }
        assert_eq!(store.counts().await.unwrap().completed, 3);

        worker.close(false).await;
    }

    #[tokio::test]
    async fn failed_attempts_are_retried_until_exhausted() {
        let store = InMemoryJobStore::arc();
        store
            .add("flaky", json!(null), JobOptions::default().with_attempts(2))
            .await
            .unwrap();

        let worker = Worker::builder(store.clone())
            .config(config())
            .processor(processor_fn(|_job: Job, _ctx: JobContext| async move {
                Err::<Value, _>(ProcessorError::failed("nope"))
            }))
            .build()
            .unwrap();
        let mut events = worker.subscribe();
        worker.start().unwrap();

        let mut next_states = Vec::new();
        for _ in 0..2 {
            if let WorkerEvent::Failed { next, failure, .. } =
                next_event(&mut events, |e| matches!(e, WorkerEvent::Failed { .. })).await
            {
                assert_eq!(failure.message, "nope");
                next_states.push(next);
            }
        }
        assert_eq!(next_states, vec![JobState::Waiting, JobState::Failed]);

        worker.close(false).await;
    }

    #[tokio::test]
    async fn processor_requested_delay_keeps_the_attempt() {
        let store = InMemoryJobStore::arc();
        let job = store.add("later", json!(null), JobOptions::default()).await.unwrap();

        let worker = Worker::builder(store.clone())
            .config(config())
            .processor(processor_fn(|_job: Job, _ctx: JobContext| async move {
                Err::<Value, _>(ProcessorError::Delayed(Duration::from_secs(60)))
            }))
            .build()
            .unwrap();
        let mut events = worker.subscribe();
        worker.start().unwrap();

        next_event(&mut events, |e| matches!(e, WorkerEvent::Active { .. })).await;
        next_event(&mut events, |e| matches!(e, WorkerEvent::Drained)).await;
        worker.close(false).await;

        let stored = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Delayed);
        assert_eq!(stored.attempts_made, 0);
    }

    #[tokio::test]
    async fn graceful_close_lets_in_flight_jobs_finish() {
        let store = InMemoryJobStore::arc();
        let job = store.add("slow", json!(null), JobOptions::default()).await.unwrap();

        let worker = Worker::builder(store.clone())
            .config(config())
            .processor(processor_fn(|_job: Job, _ctx: JobContext| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(json!("done"))
            }))
            .build()
            .unwrap();
        let mut events = worker.subscribe();
        worker.start().unwrap();

        next_event(&mut events, |e| matches!(e, WorkerEvent::Active { .. })).await;
        worker.close(false).await;

        assert!(!worker.is_running());
        assert_eq!(store.get(&job.id).await.unwrap().unwrap().state, JobState::Completed);
        next_event(&mut events, |e| matches!(e, WorkerEvent::Closed)).await;
    }

    #[tokio::test]
    async fn forced_close_leaves_the_job_active() {
        let store = InMemoryJobStore::arc();
        let job = store.add("stuck", json!(null), JobOptions::default()).await.unwrap();

        let worker = Worker::builder(store.clone())
            .config(config())
            .processor(processor_fn(|_job: Job, _ctx: JobContext| async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Value::Null)
            }))
            .build()
            .unwrap();
        let mut events = worker.subscribe();
        worker.start().unwrap();

        next_event(&mut events, |e| matches!(e, WorkerEvent::Active { .. })).await;
        tokio::time::timeout(Duration::from_secs(5), worker.close(true))
            .await
            .expect("forced close should not wait for the job");

        assert_eq!(store.get(&job.id).await.unwrap().unwrap().state, JobState::Active);
        assert_eq!(worker.in_flight(), 0);
    }

    #[tokio::test]
    async fn stalled_jobs_are_requeued_and_picked_up() {
        let store = InMemoryJobStore::arc();
        let job = store.add("orphan", json!(null), JobOptions::default()).await.unwrap();

        // Another worker took the job and vanished.
        let ghost = LockToken::new(WorkerId::new(), 1);
        store.fetch_next_job(&ghost, Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let worker = Worker::builder(store.clone())
            .config(config().with_stalled_interval(Duration::from_millis(50)))
            .processor(processor_fn(|_job: Job, _ctx: JobContext| async move { Ok(json!(1)) }))
            .build()
            .unwrap();
        let mut events = worker.subscribe();
        worker.start().unwrap();

        match next_event(&mut events, |e| matches!(e, WorkerEvent::Stalled { .. })).await {
            WorkerEvent::Stalled { job_id } => assert_eq!(job_id, job.id),
            other => panic!("unexpected {other:?}"),
        }
        next_event(&mut events, |e| matches!(e, WorkerEvent::Completed { .. })).await;

        worker.close(false).await;
    }

    fn short_locks() -> WorkerConfig {
        config()
            .with_lock_duration(Duration::from_millis(200))
            .with_lock_renew_margin(Duration::from_millis(100))
            .with_stalled_interval(Duration::from_millis(30))
    }

    #[tokio::test]
    async fn renewed_lock_outlives_the_stalled_sweep() {
        let store = InMemoryJobStore::arc();
        let job = store.add("long", json!(null), JobOptions::default()).await.unwrap();

        let worker = Worker::builder(store.clone())
            .config(short_locks())
            .processor(processor_fn(|_job: Job, _ctx: JobContext| async move {
                tokio::time::sleep(Duration::from_millis(900)).await;
                Ok(json!("done"))
            }))
            .build()
            .unwrap();
        let mut events = worker.subscribe();
        worker.start().unwrap();

        let event = next_event(&mut events, |e| {
            matches!(e, WorkerEvent::Completed { .. } | WorkerEvent::Stalled { .. })
        })
        .await;
        assert!(matches!(event, WorkerEvent::Completed { .. }), "unexpected {event:?}");
        worker.close(false).await;

        let stored = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.stalled_counter, 0);
        assert_eq!(stored.attempts_made, 1);
    }

    #[tokio::test]
    async fn unrenewable_lock_abandons_the_run_and_requeues_once() {
        let store = Arc::new(ScriptedStore {
            fail_renewals: true,
            ..Default::default()
        });
        let job = store.add("fragile", json!(null), JobOptions::default()).await.unwrap();

        let runs = Arc::new(AtomicUsize::new(0));
        let counted = runs.clone();
        let worker = Worker::builder(store.clone())
            .config(short_locks().with_max_stalled_count(1))
            .processor(processor_fn(move |_job: Job, _ctx: JobContext| {
                let first = counted.fetch_add(1, Ordering::SeqCst) == 0;
                async move {
                    if first {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                    }
                    Ok(json!("second run"))
                }
            }))
            .build()
            .unwrap();
        let mut events = worker.subscribe();
        worker.start().unwrap();

        match next_event(&mut events, |e| matches!(e, WorkerEvent::Stalled { .. })).await {
            WorkerEvent::Stalled { job_id } => assert_eq!(job_id, job.id),
            other => panic!("unexpected {other:?}"),
        }
        next_event(&mut events, |e| matches!(e, WorkerEvent::Completed { .. })).await;
        worker.close(false).await;

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(store.completions.load(Ordering::SeqCst), 1);
        let stored = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.stalled_counter, 1);
    }

    #[tokio::test]
    async fn reports_for_a_lost_lock_are_dropped_quietly() {
        let store = Arc::new(ScriptedStore {
            reject_completions: true,
            ..Default::default()
        });
        store.add("late", json!(null), JobOptions::default()).await.unwrap();

        let worker = Worker::builder(store.clone())
            .config(config())
            .processor(processor_fn(|_job: Job, _ctx: JobContext| async move { Ok(json!("late")) }))
            .build()
            .unwrap();
        let mut events = worker.subscribe();
        worker.start().unwrap();

        tokio::time::timeout(Duration::from_secs(5), store.reporting.notified())
            .await
            .expect("the outcome should be reported");
        worker.close(false).await;

        let event = next_event(&mut events, |e| {
            matches!(
                e,
                WorkerEvent::Completed { .. } | WorkerEvent::Error { .. } | WorkerEvent::Closed
            )
        })
        .await;
        assert!(matches!(event, WorkerEvent::Closed), "unexpected {event:?}");
        assert_eq!(store.completions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_reports_do_not_hold_up_fetching() {
        let store = Arc::new(ScriptedStore {
            gate: Some(Semaphore::new(0)),
            ..Default::default()
        });
        let first = store.add("a", json!(1), JobOptions::default()).await.unwrap();

        let worker = Worker::builder(store.clone())
            .config(config().with_concurrency(2))
            .processor(processor_fn(|job: Job, _ctx: JobContext| async move { Ok(job.data) }))
            .build()
            .unwrap();
        let mut events = worker.subscribe();
        worker.start().unwrap();

        tokio::time::timeout(Duration::from_secs(5), store.reporting.notified())
            .await
            .expect("first report should start");
        let second = store.add("b", json!(2), JobOptions::default()).await.unwrap();

        let second_id = second.id.clone();
        next_event(&mut events, move |e| {
            matches!(e, WorkerEvent::Active { job, .. } if job.id == second_id)
        })
        .await;
        assert_eq!(store.get(&first.id).await.unwrap().unwrap().state, JobState::Active);
        assert_eq!(worker.in_flight(), 2);

        if let Some(gate) = &store.gate {
            gate.add_permits(1);
        }
        for _ in 0..2 {
            next_event(&mut events, |e| matches!(e, WorkerEvent::Completed { .. })).await;
        }
        worker.close(false).await;

        assert_eq!(store.get(&second.id).await.unwrap().unwrap().state, JobState::Completed);
        assert_eq!(worker.in_flight(), 0);
    }

    #[tokio::test]
    async fn thread_sandboxes_run_registered_processors() {
        let store = InMemoryJobStore::arc();
        let job = store.add("sq", json!({ "n": 7 }), JobOptions::default()).await.unwrap();

        let registry = ProcessorRegistry::arc();
        registry.register(
            "square",
            processor_fn(|job: Job, _ctx: JobContext| async move {
                let n = job.data["n"].as_i64().unwrap_or(0);
                Ok(json!(n * n))
            }),
        );

        let worker = Worker::builder(store.clone())
            .config(config().with_sandbox(SandboxKind::Thread, "square"))
            .registry(registry)
            .build()
            .unwrap();
        let mut events = worker.subscribe();
        worker.start().unwrap();

        next_event(&mut events, |e| matches!(e, WorkerEvent::Completed { .. })).await;
        let pool = worker.pool().unwrap().clone();
        assert_eq!(pool.retained_count() + pool.free_count(), 1);

        worker.close(false).await;
        assert_eq!(store.get(&job.id).await.unwrap().unwrap().return_value, Some(json!(49)));
        assert_eq!(pool.retained_count() + pool.free_count(), 0);
    }

    #[tokio::test]
    async fn construction_rejects_missing_processors() {
        let store: Arc<dyn JobStore> = InMemoryJobStore::arc();

        let no_processor = Worker::builder(store.clone()).config(config()).build();
        assert!(matches!(no_processor, Err(WorkerError::ProcessorLoad(_))));

        let missing_exe = Worker::builder(store.clone())
            .config(config().with_sandbox(SandboxKind::Process, "/nonexistent/taskmill-processor"))
            .build();
        assert!(matches!(missing_exe, Err(WorkerError::ProcessorLoad(_))));

        let unregistered = Worker::builder(store)
            .config(config().with_sandbox(SandboxKind::Thread, "missing"))
            .registry(ProcessorRegistry::arc())
            .build();
        assert!(matches!(unregistered, Err(WorkerError::ProcessorLoad(_))));
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let worker = Worker::builder(InMemoryJobStore::arc())
            .config(config())
            .processor(processor_fn(|_job: Job, _ctx: JobContext| async move { Ok(Value::Null) }))
            .build()
            .unwrap();

        worker.start().unwrap();
        assert!(matches!(worker.start(), Err(WorkerError::AlreadyRunning)));
        worker.close(false).await;
        assert!(matches!(worker.start(), Err(WorkerError::Closed)));
    }

    #[test]
    fn autorun_outside_a_runtime_fails() {
        let result = Worker::builder(InMemoryJobStore::arc())
            .config(WorkerConfig::default())
            .processor(processor_fn(|_job: Job, _ctx: JobContext| async move { Ok(Value::Null) }))
            .build();
        assert!(matches!(result, Err(WorkerError::NoRuntime)));
    }
}
