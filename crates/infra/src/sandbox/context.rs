//! Isolated execution contexts.
//!
//! A context is a message pipe to a child plus a way to kill it and observe
//! its exit. Two backends exist: OS child processes speaking newline-delimited
//! JSON, and dedicated threads running their own current-thread runtime.

use std::panic::AssertUnwindSafe;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::sandbox::SandboxError;
use crate::sandbox::child;
use crate::sandbox::protocol::{ChildMessage, ParentMessage, decode_line, encode_line};
use crate::sandbox::registry::ProcessorRegistry;

/// Which isolation primitive backs a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxKind {
    /// OS child process running the executable at the processor path.
    #[default]
    Process,
    /// Dedicated thread running a processor from a [`ProcessorRegistry`].
    Thread,
}

impl core::str::FromStr for SandboxKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" => Ok(SandboxKind::Process),
            "thread" => Ok(SandboxKind::Thread),
            other => Err(format!("unknown sandbox kind '{other}'")),
        }
    }
}

/// Pool-unique context identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

impl core::fmt::Display for ContextId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// How a context ended.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

impl ExitInfo {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signal(name: impl Into<String>) -> Self {
        Self {
            code: None,
            signal: Some(name.into()),
        }
    }

    /// `Unexpected exit code: <code> signal: <signal>`, `null` for a missing part.
    pub fn crash_message(&self) -> String {
        let code = self
            .code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "null".to_string());
        let signal = self.signal.as_deref().unwrap_or("null");
        format!("Unexpected exit code: {code} signal: {signal}")
    }

    fn from_status(status: std::io::Result<std::process::ExitStatus>) -> Self {
        let Ok(status) = status else {
            return Self::default();
        };

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            Self {
                code: status.code(),
                signal: status.signal().map(signal_name),
            }
        }

        #[cfg(not(unix))]
        {
            Self {
                code: status.code(),
                signal: None,
            }
        }
    }
}

#[cfg(unix)]
fn signal_name(signal: i32) -> String {
    match signal {
        1 => "SIGHUP".to_string(),
        2 => "SIGINT".to_string(),
        3 => "SIGQUIT".to_string(),
        6 => "SIGABRT".to_string(),
        9 => "SIGKILL".to_string(),
        11 => "SIGSEGV".to_string(),
        13 => "SIGPIPE".to_string(),
        15 => "SIGTERM".to_string(),
        other => format!("SIG{other}"),
    }
}

/// Parent-side handle of one isolated context.
pub struct SandboxContext {
    id: ContextId,
    processor_path: String,
    kind: SandboxKind,
    outbox: mpsc::UnboundedSender<ParentMessage>,
    inbox: Mutex<mpsc::UnboundedReceiver<ChildMessage>>,
    kill: CancellationToken,
    exit: watch::Receiver<Option<ExitInfo>>,
}

impl SandboxContext {
    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn processor_path(&self) -> &str {
        &self.processor_path
    }

    pub fn kind(&self) -> SandboxKind {
        self.kind
    }

    /// Neither exited nor asked to die.
    pub fn is_alive(&self) -> bool {
        !self.kill.is_cancelled() && self.exit.borrow().is_none()
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit.borrow().clone()
    }

    pub fn send(&self, message: ParentMessage) -> Result<(), SandboxError> {
        self.outbox
            .send(message)
            .map_err(|_| SandboxError::Channel(format!("{} is not accepting messages", self.id)))
    }

    /// Next message from the child; `None` once the channel closed.
    pub async fn recv(&self) -> Option<ChildMessage> {
        self.inbox.lock().await.recv().await
    }

    /// Request termination. Idempotent.
    pub fn kill(&self) {
        self.kill.cancel();
    }

    /// Wait for the context to exit.
    pub async fn wait_exit(&self) -> ExitInfo {
        let mut exit = self.exit.clone();
        let info = match exit.wait_for(|info| info.is_some()).await {
            Ok(info) => info.clone().unwrap_or_default(),
            // Sender gone without a status: the reaper itself was torn down.
            Err(_) => ExitInfo::default(),
        };
        info
    }

    /// Wait at most `limit` for the exit status.
    pub async fn wait_exit_timeout(&self, limit: Duration) -> ExitInfo {
        tokio::time::timeout(limit, self.wait_exit())
            .await
            .unwrap_or_default()
    }

    /// Spawn the executable at `processor_path` as a child process.
    pub(crate) fn spawn_process(id: ContextId, processor_path: &str) -> Result<Self, SandboxError> {
        let mut child = Command::new(processor_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SandboxError::Spawn {
                path: processor_path.to_string(),
                source,
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Channel(format!("{id}: child stdin unavailable")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Channel(format!("{id}: child stdout unavailable")))?;

        let (outbox, mut to_child) = mpsc::unbounded_channel::<ParentMessage>();
        let (from_child, inbox) = mpsc::unbounded_channel::<ChildMessage>();
        let kill = CancellationToken::new();
        let (exit_tx, exit) = watch::channel(None);

        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(message) = to_child.recv().await {
                let line = match encode_line(&message) {
                    Ok(line) => line,
                    Err(err) => {
                        warn!(context = %id, error = %err, "failed to encode parent message");
                        continue;
                    }
                };
                if stdin.write_all(line.as_bytes()).await.is_err() || stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match decode_line::<ChildMessage>(&line) {
                    Ok(message) => {
                        if from_child.send(message).is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(context = %id, error = %err, "ignoring malformed child message"),
                }
            }
        });

        let reaper_kill = kill.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = reaper_kill.cancelled() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let info = ExitInfo::from_status(status);
            debug!(context = %id, code = ?info.code, signal = ?info.signal, "sandbox process exited");
            let _ = exit_tx.send(Some(info));
        });

        Ok(Self {
            id,
            processor_path: processor_path.to_string(),
            kind: SandboxKind::Process,
            outbox,
            inbox: Mutex::new(inbox),
            kill,
            exit,
        })
    }

    /// Start a dedicated thread serving the processor registered under
    /// `processor_path`.
    ///
    /// A panic in job logic ends the thread and is reported as exit code 1.
    pub(crate) fn spawn_thread(
        id: ContextId,
        processor_path: &str,
        registry: Arc<ProcessorRegistry>,
    ) -> Result<Self, SandboxError> {
        let (outbox, to_child) = mpsc::unbounded_channel::<ParentMessage>();
        let (from_child, inbox) = mpsc::unbounded_channel::<ChildMessage>();
        let kill = CancellationToken::new();
        let (exit_tx, exit) = watch::channel(None);

        let thread_kill = kill.clone();
        std::thread::Builder::new()
            .name(format!("taskmill-{id}"))
            .spawn(move || {
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    let runtime = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()?;
                    let killed = runtime.block_on(async move {
                        tokio::select! {
                            _ = child::run_loop(|path| registry.resolve(path), to_child, from_child) => false,
                            _ = thread_kill.cancelled() => true,
                        }
                    });
                    Ok::<_, std::io::Error>(killed)
                }));

                let info = match outcome {
                    Ok(Ok(false)) => ExitInfo::code(0),
                    Ok(Ok(true)) => ExitInfo::signal("SIGKILL"),
                    Ok(Err(err)) => {
                        warn!(context = %id, error = %err, "sandbox thread runtime failed");
                        ExitInfo::code(1)
                    }
                    Err(_) => ExitInfo::code(1),
                };
                let _ = exit_tx.send(Some(info));
            })
            .map_err(|source| SandboxError::Spawn {
                path: processor_path.to_string(),
                source,
            })?;

        Ok(Self {
            id,
            processor_path: processor_path.to_string(),
            kind: SandboxKind::Thread,
            outbox,
            inbox: Mutex::new(inbox),
            kill,
            exit,
        })
    }
}

impl core::fmt::Debug for SandboxContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SandboxContext")
            .field("id", &self.id)
            .field("processor_path", &self.processor_path)
            .field("kind", &self.kind)
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_message_uses_null_for_missing_parts() {
        assert_eq!(
            ExitInfo::code(3).crash_message(),
            "Unexpected exit code: 3 signal: null"
        );
        assert_eq!(
            ExitInfo::signal("SIGKILL").crash_message(),
            "Unexpected exit code: null signal: SIGKILL"
        );
        assert_eq!(
            ExitInfo::default().crash_message(),
            "Unexpected exit code: null signal: null"
        );
    }

    #[test]
    fn sandbox_kind_parses_case_insensitively() {
        assert_eq!("Thread".parse::<SandboxKind>(), Ok(SandboxKind::Thread));
        assert_eq!("process".parse::<SandboxKind>(), Ok(SandboxKind::Process));
        assert!("vm".parse::<SandboxKind>().is_err());
    }

    #[tokio::test]
    async fn missing_executable_is_a_spawn_error() {
        let err = SandboxContext::spawn_process(ContextId(1), "/definitely/not/here").unwrap_err();
        assert!(matches!(err, SandboxError::Spawn { .. }));
    }

    #[tokio::test]
    async fn killed_thread_context_reports_a_signal() {
        let ctx = SandboxContext::spawn_thread(ContextId(2), "none", ProcessorRegistry::arc()).unwrap();
        assert!(ctx.is_alive());

        ctx.kill();
        assert!(!ctx.is_alive());
        let info = ctx.wait_exit_timeout(Duration::from_secs(5)).await;
        assert_eq!(info.signal.as_deref(), Some("SIGKILL"));
    }
}
