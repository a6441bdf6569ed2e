//! Parent/child execution protocol.
//!
//! Process-backed contexts exchange these messages as newline-delimited JSON
//! over the child's stdin/stdout. Thread-backed contexts pass them over
//! in-process channels unchanged.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use taskmill_core::{Job, ProcessorError};

/// Parent → child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ParentMessage {
    /// Load the processor bound to this context.
    Init { processor_path: String },
    /// Run one job.
    Start { job: Box<Job> },
    /// Exit cleanly.
    Stop,
}

/// Child → parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ChildMessage {
    InitCompleted,
    InitFailed { error: String },
    Progress { value: Value },
    Log { line: String },
    /// Replacement payload for the running job.
    Update { data: Value },
    Completed { value: Value },
    Failed { error: WireError },
}

impl ChildMessage {
    /// Whether this message ends the current dispatch.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChildMessage::Completed { .. } | ChildMessage::Failed { .. })
    }
}

/// Serializable form of [`ProcessorError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireError {
    Failed { message: String },
    Unrecoverable { message: String },
    Delayed { delay_ms: u64 },
}

impl From<ProcessorError> for WireError {
    fn from(value: ProcessorError) -> Self {
        match value {
            ProcessorError::Failed(message) => WireError::Failed { message },
            ProcessorError::Unrecoverable(message) => WireError::Unrecoverable { message },
            ProcessorError::Delayed(delay) => WireError::Delayed {
                delay_ms: delay.as_millis() as u64,
            },
        }
    }
}

impl From<WireError> for ProcessorError {
    fn from(value: WireError) -> Self {
        match value {
            WireError::Failed { message } => ProcessorError::Failed(message),
            WireError::Unrecoverable { message } => ProcessorError::Unrecoverable(message),
            WireError::Delayed { delay_ms } => ProcessorError::Delayed(Duration::from_millis(delay_ms)),
        }
    }
}

/// Encode one message as a protocol line (trailing newline included).
pub fn encode_line<M: Serialize>(message: &M) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Decode one protocol line.
pub fn decode_line<M: for<'de> Deserialize<'de>>(line: &str) -> Result<M, serde_json::Error> {
    serde_json::from_str(line.trim_end())
}
