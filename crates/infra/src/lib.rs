//! Runtime layer: the worker engine and everything it drives.
//!
//! - [`sequencer`]: tracks in-flight operations and yields their outcomes in
//!   completion order
//! - [`sandbox`]: isolated execution contexts (child processes or threads)
//! - [`store`]: the job state store client (in-memory, Redis behind the
//!   `redis` feature)
//! - [`worker`]: the engine tying them together

pub mod processor;
pub mod sandbox;
pub mod sequencer;
pub mod store;
pub mod worker;

pub use processor::{JobContext, Processor, ProgressSink, processor_fn};
pub use sandbox::{SandboxError, SandboxKind, SandboxPool};
pub use sequencer::CompletionSequencer;
pub use store::{InMemoryJobStore, JobStore, StoreError};
pub use worker::{Worker, WorkerBuilder, WorkerConfig, WorkerError};
