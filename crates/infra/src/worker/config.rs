//! Worker configuration.

use std::str::FromStr;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::sandbox::SandboxKind;
use crate::worker::WorkerError;

/// Worker configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Name used in logs and events
    pub name: String,
    /// Maximum jobs executing at once
    pub concurrency: usize,
    /// Lock lifetime granted on fetch and on every renewal
    pub lock_duration: Duration,
    /// How long before expiry the lock is renewed; also the renewal call timeout
    pub lock_renew_margin: Duration,
    /// Longest blocking wait for new work when the queue is empty
    pub drain_interval: Duration,
    /// Stalls tolerated before a job is failed
    pub max_stalled_count: u32,
    /// Period of the stalled-jobs sweep
    pub stalled_interval: Duration,
    /// Run jobs in sandbox contexts instead of inline
    pub use_isolated_execution: bool,
    /// Processor executable (process sandboxes) or registry key (thread sandboxes)
    pub processor_path: Option<String>,
    pub sandbox_kind: SandboxKind,
    /// How long a new sandbox may take to report ready
    pub handshake_timeout: Duration,
    /// Start processing as soon as the worker is built
    pub autorun: bool,
    /// How long `close` waits for in-flight jobs before abandoning them
    pub close_grace_period: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "taskmill-worker".to_string(),
            concurrency: 1,
            lock_duration: Duration::from_secs(30),
            lock_renew_margin: Duration::from_secs(15),
            drain_interval: Duration::from_secs(5),
            max_stalled_count: 1,
            stalled_interval: Duration::from_secs(30),
            use_isolated_execution: false,
            processor_path: None,
            sandbox_kind: SandboxKind::Process,
            handshake_timeout: Duration::from_secs(5),
            autorun: true,
            close_grace_period: Duration::from_secs(10),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    pub fn with_lock_renew_margin(mut self, margin: Duration) -> Self {
        self.lock_renew_margin = margin;
        self
    }

    pub fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval = interval;
        self
    }

    pub fn with_max_stalled_count(mut self, count: u32) -> Self {
        self.max_stalled_count = count;
        self
    }

    pub fn with_stalled_interval(mut self, interval: Duration) -> Self {
        self.stalled_interval = interval;
        self
    }

    /// Run jobs in sandbox contexts of `kind` serving `processor_path`.
    pub fn with_sandbox(mut self, kind: SandboxKind, processor_path: impl Into<String>) -> Self {
        self.use_isolated_execution = true;
        self.sandbox_kind = kind;
        self.processor_path = Some(processor_path.into());
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_autorun(mut self, autorun: bool) -> Self {
        self.autorun = autorun;
        self
    }

    pub fn with_close_grace_period(mut self, grace: Duration) -> Self {
        self.close_grace_period = grace;
        self
    }

    /// Defaults overridden by `TASKMILL_*` environment variables.
    ///
    /// Durations are given in milliseconds (`TASKMILL_LOCK_DURATION_MS`, ...).
    pub fn from_env() -> Result<Self, WorkerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, WorkerError> {
        let mut config = Self::default();

        if let Some(name) = lookup("TASKMILL_WORKER_NAME") {
            config.name = name;
        }
        if let Some(n) = parse(&lookup, "TASKMILL_CONCURRENCY")? {
            config.concurrency = n;
        }
        if let Some(d) = parse_ms(&lookup, "TASKMILL_LOCK_DURATION_MS")? {
            config.lock_duration = d;
        }
        if let Some(d) = parse_ms(&lookup, "TASKMILL_LOCK_RENEW_MARGIN_MS")? {
            config.lock_renew_margin = d;
        }
        if let Some(d) = parse_ms(&lookup, "TASKMILL_DRAIN_INTERVAL_MS")? {
            config.drain_interval = d;
        }
        if let Some(n) = parse(&lookup, "TASKMILL_MAX_STALLED_COUNT")? {
            config.max_stalled_count = n;
        }
        if let Some(d) = parse_ms(&lookup, "TASKMILL_STALLED_INTERVAL_MS")? {
            config.stalled_interval = d;
        }
        if let Some(path) = lookup("TASKMILL_PROCESSOR_PATH") {
            config.processor_path = Some(path);
            config.use_isolated_execution = true;
        }
        if let Some(flag) = parse(&lookup, "TASKMILL_ISOLATED")? {
            config.use_isolated_execution = flag;
        }
        if let Some(kind) = parse::<SandboxKind>(&lookup, "TASKMILL_SANDBOX_KIND")? {
            config.sandbox_kind = kind;
        }
        if let Some(d) = parse_ms(&lookup, "TASKMILL_HANDSHAKE_TIMEOUT_MS")? {
            config.handshake_timeout = d;
        }
        if let Some(flag) = parse(&lookup, "TASKMILL_AUTORUN")? {
            config.autorun = flag;
        }
        if let Some(d) = parse_ms(&lookup, "TASKMILL_CLOSE_GRACE_MS")? {
            config.close_grace_period = d;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.concurrency == 0 {
            return Err(WorkerError::Config("concurrency must be at least 1".into()));
        }
        if self.concurrency > Semaphore::MAX_PERMITS {
            return Err(WorkerError::Config(format!(
                "concurrency must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.lock_duration.is_zero() {
            return Err(WorkerError::Config("lock_duration must be positive".into()));
        }
        if self.lock_renew_margin >= self.lock_duration {
            return Err(WorkerError::Config(
                "lock_renew_margin must be shorter than lock_duration".into(),
            ));
        }
        if self.stalled_interval.is_zero() {
            return Err(WorkerError::Config("stalled_interval must be positive".into()));
        }
        Ok(())
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, WorkerError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| WorkerError::Config(format!("{key}={raw}: {e}")))
        })
        .transpose()
}

fn parse_ms(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<Duration>, WorkerError> {
    Ok(parse::<u64>(lookup, key)?.map(Duration::from_millis))
}
