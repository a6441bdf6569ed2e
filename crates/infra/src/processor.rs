//! Job logic interface.
//!
//! A [`Processor`] turns a job into a JSON result. It reports progress, log
//! lines and data updates through the [`JobContext`] it is handed; where those
//! end up (store + events inline, a protocol channel inside a sandbox) is up to
//! the [`ProgressSink`] behind the context.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use taskmill_core::{Job, ProcessorError};

/// Receiver of side-channel updates emitted while a job runs.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn progress(&self, value: Value);

    async fn log(&self, line: String);

    async fn update(&self, data: Value);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl ProgressSink for NullSink {
    async fn progress(&self, _value: Value) {}

    async fn log(&self, _line: String) {}

    async fn update(&self, _data: Value) {}
}

/// Handle passed to job logic for reporting while it runs.
#[derive(Clone)]
pub struct JobContext {
    sink: Arc<dyn ProgressSink>,
}

impl JobContext {
    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self { sink }
    }

    /// Context whose reports go nowhere.
    pub fn detached() -> Self {
        Self::new(Arc::new(NullSink))
    }

    pub async fn progress(&self, value: impl Into<Value>) {
        self.sink.progress(value.into()).await;
    }

    pub async fn log(&self, line: impl Into<String>) {
        self.sink.log(line.into()).await;
    }

    /// Replace the job's payload in the store.
    pub async fn update_data(&self, data: Value) {
        self.sink.update(data).await;
    }
}

impl core::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobContext").finish_non_exhaustive()
    }
}

/// Job logic.
///
/// Errors never escape the engine: they are recorded on the job via
/// `mark_failed` (or `move_to_delayed` for [`ProcessorError::Delayed`]).
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, job: &Job, ctx: &JobContext) -> Result<Value, ProcessorError>;
}

#[async_trait]
impl<P> Processor for Arc<P>
where
    P: Processor + ?Sized,
{
    async fn process(&self, job: &Job, ctx: &JobContext) -> Result<Value, ProcessorError> {
        (**self).process(job, ctx).await
    }
}

/// Processor backed by an async closure.
pub struct FnProcessor<F> {
    f: F,
}

/// Wrap an async closure taking an owned job snapshot and context.
///
/// ```ignore
/// let processor = processor_fn(|job, _ctx| async move {
///     Ok(serde_json::json!({ "echo": job.data }))
/// });
/// ```
pub fn processor_fn<F, Fut>(f: F) -> FnProcessor<F>
where
    F: Fn(Job, JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ProcessorError>> + Send,
{
    FnProcessor { f }
}

#[async_trait]
impl<F, Fut> Processor for FnProcessor<F>
where
    F: Fn(Job, JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ProcessorError>> + Send,
{
    async fn process(&self, job: &Job, ctx: &JobContext) -> Result<Value, ProcessorError> {
        (self.f)(job.clone(), ctx.clone()).await
    }
}
