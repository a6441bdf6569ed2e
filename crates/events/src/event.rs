//! Worker lifecycle events.

use std::sync::Arc;

use serde::Serialize;

use taskmill_core::{Job, JobFailure, JobId, JobState};

/// Fixed set of event kinds a worker emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Active,
    Progress,
    Completed,
    Failed,
    Stalled,
    Drained,
    Error,
    Closing,
    Closed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Active => "active",
            EventKind::Progress => "progress",
            EventKind::Completed => "completed",
            EventKind::Failed => "failed",
            EventKind::Stalled => "stalled",
            EventKind::Drained => "drained",
            EventKind::Error => "error",
            EventKind::Closing => "closing",
            EventKind::Closed => "closed",
        }
    }
}

/// Event emitted by a worker, with a typed payload per kind.
///
/// Job payloads are shared snapshots (`Arc<Job>`) taken when the event was
/// emitted; they are not refreshed afterwards.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// A job was fetched and is about to execute.
    Active { job: Arc<Job>, prev: JobState },
    /// Job logic reported progress.
    Progress { job_id: JobId, progress: serde_json::Value },
    /// A job completed and the store accepted the result.
    Completed { job: Arc<Job>, result: serde_json::Value },
    /// An attempt failed. `next` is where the store moved the job.
    Failed { job: Arc<Job>, failure: JobFailure, next: JobState },
    /// Stalled recovery requeued a job whose lock expired.
    Stalled { job_id: JobId },
    /// The queue had no more work for this worker.
    Drained,
    /// A transient engine-level error (store, sandbox lifecycle).
    Error { message: String },
    /// `close` was requested.
    Closing { reason: String },
    /// The worker finished closing.
    Closed,
}

impl WorkerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            WorkerEvent::Active { .. } => EventKind::Active,
            WorkerEvent::Progress { .. } => EventKind::Progress,
            WorkerEvent::Completed { .. } => EventKind::Completed,
            WorkerEvent::Failed { .. } => EventKind::Failed,
            WorkerEvent::Stalled { .. } => EventKind::Stalled,
            WorkerEvent::Drained => EventKind::Drained,
            WorkerEvent::Error { .. } => EventKind::Error,
            WorkerEvent::Closing { .. } => EventKind::Closing,
            WorkerEvent::Closed => EventKind::Closed,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        WorkerEvent::Error {
            message: message.into(),
        }
    }

    /// Id of the job this event is about, if any.
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            WorkerEvent::Active { job, .. }
            | WorkerEvent::Completed { job, .. }
            | WorkerEvent::Failed { job, .. } => Some(&job.id),
            WorkerEvent::Progress { job_id, .. } | WorkerEvent::Stalled { job_id } => Some(job_id),
            _ => None,
        }
    }
}
