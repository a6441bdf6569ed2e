//! Error model shared by the store, the engine and job logic.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for pure model operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Model-level error (parsing, validation).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A value failed validation (e.g. zero attempts).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier could not be parsed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}

/// Error returned by job logic.
///
/// Job logic never aborts the engine: every variant is captured and turned
/// into a store transition.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProcessorError {
    /// Ordinary failure; retried while attempts remain.
    #[error("{0}")]
    Failed(String),

    /// Failure that forfeits remaining attempts.
    #[error("{0}")]
    Unrecoverable(String),

    /// The job asks to be run again later without consuming an attempt.
    #[error("job deferred for {0:?}")]
    Delayed(Duration),
}

impl ProcessorError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn unrecoverable(msg: impl Into<String>) -> Self {
        Self::Unrecoverable(msg.into())
    }
}

/// Why an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Job logic reported an error.
    Processor,
    /// Job logic declared the error unrecoverable.
    Unrecoverable,
    /// The isolated context running the job died mid-execution.
    Crash,
    /// The isolated context could not be spawned or initialized.
    Sandbox,
    /// The job stalled more often than allowed.
    Stalled,
}

/// Failure record reported to the store by `mark_failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn processor(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Processor, message)
    }

    pub fn unrecoverable(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Unrecoverable, message)
    }

    pub fn crash(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Crash, message)
    }

    /// Whether this failure skips remaining attempts.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self.kind, FailureKind::Unrecoverable | FailureKind::Stalled)
    }
}

impl core::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.message)
    }
}
