//! Tracing/logging setup shared by worker processes and processor binaries.

/// Initialize process-wide tracing/logging.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::from_env());
}

/// Like [`init`] but logs to stderr.
///
/// Sandboxed processor processes must use this: their stdout carries the
/// parent/child message channel.
pub fn init_stderr() {
    tracing::init_stderr(tracing::LogFormat::from_env());
}

/// Tracing configuration (filters, formats).
pub mod tracing;
