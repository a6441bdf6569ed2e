//! `taskmill-core`: job model building blocks.
//!
//! This crate contains **pure** primitives (no IO, no async): identifiers,
//! the job record and its options, backoff math and the failure taxonomy.

pub mod error;
pub mod id;
pub mod job;

pub use error::{CoreError, CoreResult, FailureKind, JobFailure, ProcessorError};
pub use id::{JobId, LockToken, WorkerId};
pub use job::{
    BackoffPolicy, BackoffStrategy, Job, JobLock, JobOptions, JobState, RetryDecision, to_chrono,
};
