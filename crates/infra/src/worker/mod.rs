//! Worker engine.
//!
//! A [`Worker`] keeps up to `concurrency` jobs in flight: it fetches jobs from
//! a [`JobStore`](crate::store::JobStore), runs each one (inline or in a
//! sandbox) as a tracked operation with a lock heartbeat, and reports outcomes
//! back to the store in the order they finish.

mod config;
mod engine;
mod execution;

pub use config::WorkerConfig;
pub use engine::{Worker, WorkerBuilder};

use tokio::task::JoinError;

use crate::store::StoreError;

/// Engine construction and lifecycle errors.
///
/// Job-logic failures never show up here; they are recorded on the job.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// No usable processor (missing path, unknown registry key, no inline
    /// processor).
    #[error("failed to load processor: {0}")]
    ProcessorLoad(String),

    #[error("invalid worker configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("worker is already running")]
    AlreadyRunning,

    #[error("worker is closed")]
    Closed,

    #[error("worker must be started inside a Tokio runtime")]
    NoRuntime,

    /// A tracked operation panicked outside job logic.
    #[error("tracked job task failed: {0}")]
    Task(String),
}

impl From<JoinError> for WorkerError {
    fn from(value: JoinError) -> Self {
        WorkerError::Task(value.to_string())
    }
}
