//! Sandboxed job execution.
//!
//! - `protocol`: parent/child message set and line codec
//! - `context`: one isolated context (child process or dedicated thread)
//! - `pool`: free/retained bookkeeping, handshake, dispatch, teardown
//! - `child`: the child-side loop processor executables run
//! - `registry`: processors addressable by path for thread-backed contexts

pub mod child;
pub mod context;
pub mod pool;
pub mod protocol;
pub mod registry;

use std::time::Duration;

pub use context::{ContextId, ExitInfo, SandboxContext, SandboxKind};
pub use pool::{Binding, SandboxPool};
pub use protocol::{ChildMessage, ParentMessage, WireError};
pub use registry::ProcessorRegistry;

/// Sandbox lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to spawn sandbox for '{path}': {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("sandbox for '{path}' was not ready within {timeout:?}")]
    HandshakeTimeout { path: String, timeout: Duration },

    /// The context died mid-execution. Carries the exit description.
    #[error("{0}")]
    Crash(String),

    /// The child could not load its processor (`InitFailed`).
    #[error("failed to load processor: {0}")]
    ProcessorLoad(String),

    #[error("sandbox channel error: {0}")]
    Channel(String),
}
