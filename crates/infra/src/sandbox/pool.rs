//! Pool of isolated execution contexts.
//!
//! Every context lives in one table entry whose binding is either `Free`
//! (idle, reusable for the same processor path) or `Retained` (owned by one
//! dispatch). A context never appears in both; dead contexts are dropped from
//! the table instead of being handed out again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use taskmill_core::{Job, ProcessorError};

use crate::processor::ProgressSink;
use crate::sandbox::SandboxError;
use crate::sandbox::context::{ContextId, SandboxContext, SandboxKind};
use crate::sandbox::protocol::{ChildMessage, ParentMessage};
use crate::sandbox::registry::ProcessorRegistry;

/// Upper bound on waiting for a killed or crashed context to report its exit.
const EXIT_WAIT: Duration = Duration::from_secs(2);

/// How long a free context may take to exit after `Stop` during `clean`.
const STOP_GRACE: Duration = Duration::from_millis(500);

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Binding of a context in the pool table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Free,
    Retained,
}

#[derive(Debug)]
struct Entry {
    ctx: Arc<SandboxContext>,
    binding: Binding,
}

/// Pool of sandbox contexts keyed by processor path.
#[derive(Debug)]
pub struct SandboxPool {
    kind: SandboxKind,
    registry: Arc<ProcessorRegistry>,
    handshake_timeout: Duration,
    table: Mutex<HashMap<ContextId, Entry>>,
    next_id: AtomicU64,
}

impl SandboxPool {
    pub fn new(kind: SandboxKind) -> Self {
        Self {
            kind,
            registry: ProcessorRegistry::arc(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            table: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_registry(mut self, registry: Arc<ProcessorRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn kind(&self) -> SandboxKind {
        self.kind
    }

    pub fn registry(&self) -> &Arc<ProcessorRegistry> {
        &self.registry
    }

    fn table(&self) -> MutexGuard<'_, HashMap<ContextId, Entry>> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hand out a ready context for `processor_path`, reusing a free one when
    /// possible.
    #[instrument(skip(self), fields(kind = ?self.kind))]
    pub async fn retain(&self, processor_path: &str) -> Result<Arc<SandboxContext>, SandboxError> {
        if let Some(ctx) = self.take_free(processor_path) {
            debug!(context = %ctx.id(), "reusing free sandbox");
            return Ok(ctx);
        }

        let id = ContextId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let ctx = Arc::new(match self.kind {
            SandboxKind::Process => SandboxContext::spawn_process(id, processor_path)?,
            SandboxKind::Thread => {
                SandboxContext::spawn_thread(id, processor_path, self.registry.clone())?
            }
        });

        self.table().insert(
            id,
            Entry {
                ctx: ctx.clone(),
                binding: Binding::Retained,
            },
        );

        let mut guard = RetainGuard::new(self, ctx.clone());
        if let Err(err) = self.handshake(&ctx).await {
            guard.disarm();
            warn!(context = %id, error = %err, "sandbox handshake failed");
            self.remove(&ctx).await;
            return Err(err);
        }
        guard.disarm();

        info!(context = %id, "sandbox ready");
        Ok(ctx)
    }

    fn take_free(&self, processor_path: &str) -> Option<Arc<SandboxContext>> {
        let mut table = self.table();

        let dead: Vec<ContextId> = table
            .iter()
            .filter(|(_, e)| e.binding == Binding::Free && !e.ctx.is_alive())
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            if let Some(entry) = table.remove(&id) {
                entry.ctx.kill();
            }
        }

        let entry = table
            .values_mut()
            .filter(|e| e.binding == Binding::Free && e.ctx.processor_path() == processor_path)
            .min_by_key(|e| e.ctx.id())?;
        entry.binding = Binding::Retained;
        Some(entry.ctx.clone())
    }

    async fn handshake(&self, ctx: &SandboxContext) -> Result<(), SandboxError> {
        ctx.send(ParentMessage::Init {
            processor_path: ctx.processor_path().to_string(),
        })?;

        let ready = async {
            loop {
                match ctx.recv().await {
                    Some(ChildMessage::InitCompleted) => return Ok(()),
                    Some(ChildMessage::InitFailed { error }) => {
                        return Err(SandboxError::ProcessorLoad(error));
                    }
                    Some(other) => debug!(context = %ctx.id(), message = ?other, "ignoring message before ready"),
                    None => {
                        let exit = ctx.wait_exit_timeout(EXIT_WAIT).await;
                        return Err(SandboxError::Crash(exit.crash_message()));
                    }
                }
            }
        };

        match tokio::time::timeout(self.handshake_timeout, ready).await {
            Ok(res) => res,
            Err(_) => Err(SandboxError::HandshakeTimeout {
                path: ctx.processor_path().to_string(),
                timeout: self.handshake_timeout,
            }),
        }
    }

    /// Return a retained context to the free set. Dead contexts are dropped
    /// instead; free or unknown contexts are left alone.
    pub fn release(&self, ctx: &SandboxContext) {
        let mut table = self.table();
        let Some(entry) = table.get_mut(&ctx.id()) else {
            return;
        };
        if entry.binding != Binding::Retained {
            return;
        }

        if ctx.is_alive() {
            entry.binding = Binding::Free;
        } else {
            table.remove(&ctx.id());
            ctx.kill();
            debug!(context = %ctx.id(), exit = ?ctx.exit_info(), "dropping dead sandbox on release");
        }
    }

    /// Forcefully terminate `ctx` and drop it from the pool. Idempotent; waits
    /// a bounded time for the exit.
    pub async fn remove(&self, ctx: &SandboxContext) {
        self.forget(ctx.id());
        ctx.kill();
        ctx.wait_exit_timeout(EXIT_WAIT).await;
    }

    fn forget(&self, id: ContextId) -> Option<Arc<SandboxContext>> {
        self.table().remove(&id).map(|e| e.ctx)
    }

    fn with_binding(&self, binding: Binding) -> Vec<Arc<SandboxContext>> {
        let mut out: Vec<_> = self
            .table()
            .values()
            .filter(|e| e.binding == binding)
            .map(|e| e.ctx.clone())
            .collect();
        out.sort_by_key(|c| c.id());
        out
    }

    pub fn free(&self) -> Vec<Arc<SandboxContext>> {
        self.with_binding(Binding::Free)
    }

    pub fn retained(&self) -> Vec<Arc<SandboxContext>> {
        self.with_binding(Binding::Retained)
    }

    pub fn free_count(&self) -> usize {
        self.table().values().filter(|e| e.binding == Binding::Free).count()
    }

    pub fn retained_count(&self) -> usize {
        self.table().values().filter(|e| e.binding == Binding::Retained).count()
    }

    /// Terminate every context, free and retained. Returns the ids killed.
    ///
    /// Free contexts are asked to `Stop` and get a short grace period to exit on
    /// their own; retained ones are killed straight away.
    #[instrument(skip(self))]
    pub async fn clean(&self) -> Vec<ContextId> {
        let entries: Vec<Entry> = {
            let mut table = self.table();
            table.drain().map(|(_, e)| e).collect()
        };

        let mut stopping = Vec::new();
        for entry in &entries {
            match entry.binding {
                Binding::Free if entry.ctx.send(ParentMessage::Stop).is_ok() => stopping.push(entry.ctx.clone()),
                _ => entry.ctx.kill(),
            }
        }

        let stopped = async {
            for ctx in &stopping {
                ctx.wait_exit().await;
            }
        };
        if tokio::time::timeout(STOP_GRACE, stopped).await.is_err() {
            debug!("free sandboxes ignored stop; killing them");
        }

        let contexts: Vec<Arc<SandboxContext>> = entries.into_iter().map(|e| e.ctx).collect();
        for ctx in &contexts {
            ctx.kill();
        }

        let settle = async {
            for ctx in &contexts {
                ctx.wait_exit().await;
            }
        };
        if tokio::time::timeout(EXIT_WAIT, settle).await.is_err() {
            warn!("some sandboxes did not report an exit in time");
        }

        let mut ids: Vec<ContextId> = contexts.iter().map(|c| c.id()).collect();
        ids.sort();
        if !ids.is_empty() {
            info!(count = ids.len(), "sandboxes cleaned");
        }
        ids
    }

    /// Run `job` in a context for `processor_path`.
    ///
    /// The outer error is a sandbox failure (spawn, handshake, crash); the
    /// inner result is what the job logic returned. If this future is dropped
    /// before the job finishes, the context is killed and removed.
    #[instrument(skip(self, job, sink), fields(job_id = %job.id))]
    pub async fn run(
        &self,
        processor_path: &str,
        job: &Job,
        sink: &dyn ProgressSink,
    ) -> Result<Result<Value, ProcessorError>, SandboxError> {
        let ctx = self.retain(processor_path).await?;
        let mut guard = RetainGuard::new(self, ctx.clone());

        ctx.send(ParentMessage::Start {
            job: Box::new(job.clone()),
        })?;

        let outcome = loop {
            match ctx.recv().await {
                Some(ChildMessage::Progress { value }) => sink.progress(value).await,
                Some(ChildMessage::Log { line }) => sink.log(line).await,
                Some(ChildMessage::Update { data }) => sink.update(data).await,
                Some(ChildMessage::Completed { value }) => break Ok(value),
                Some(ChildMessage::Failed { error }) => break Err(ProcessorError::from(error)),
                Some(other) => debug!(context = %ctx.id(), message = ?other, "unexpected message during job"),
                None => {
                    guard.disarm();
                    let exit = ctx.wait_exit_timeout(EXIT_WAIT).await;
                    self.remove(&ctx).await;
                    warn!(context = %ctx.id(), code = ?exit.code, signal = ?exit.signal, "sandbox crashed");
                    return Err(SandboxError::Crash(exit.crash_message()));
                }
            }
        };

        guard.disarm();
        self.release(&ctx);
        Ok(outcome)
    }
}

/// Kills and forgets a retained context unless disarmed.
struct RetainGuard<'a> {
    pool: &'a SandboxPool,
    ctx: Arc<SandboxContext>,
    armed: bool,
}

impl<'a> RetainGuard<'a> {
    fn new(pool: &'a SandboxPool, ctx: Arc<SandboxContext>) -> Self {
        Self {
            pool,
            ctx,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for RetainGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!(context = %self.ctx.id(), "abandoning retained sandbox");
            self.pool.forget(self.ctx.id());
            self.ctx.kill();
        }
    }
}
