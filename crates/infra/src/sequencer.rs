//! Completion-ordered sequencing of concurrent operations.
//!
//! Operations are registered as they start and run as independent tasks. As
//! each one settles its outcome is appended to a log (an unbounded channel);
//! a single consumer drains the log in settlement order. Registration never
//! waits and the consumer only waits when nothing has settled yet.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Notify, mpsc};
use tokio::task::JoinError;

#[derive(Debug, Default)]
struct Counts {
    pending: usize,
    queued: usize,
}

/// One settled slot: `Ok(None)` is a failure swallowed in ignore-errors mode.
type Slot<T, E> = Result<Option<T>, E>;

struct Shared<T, E> {
    counts: Mutex<Counts>,
    log: mpsc::UnboundedSender<Slot<T, E>>,
    settled: Notify,
    ignore_errors: bool,
}

impl<T, E> Shared<T, E> {
    fn counts(&self) -> MutexGuard<'_, Counts> {
        self.counts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn settle(&self, outcome: Result<T, E>) {
        let slot = match outcome {
            Ok(value) => Ok(Some(value)),
            Err(_) if self.ignore_errors => Ok(None),
            Err(err) => Err(err),
        };

        {
            let mut counts = self.counts();
            counts.pending -= 1;
            counts.queued += 1;
            // The receiver lives as long as the sequencer; once it is gone
            // nobody can observe the slot anyway.
            let _ = self.log.send(slot);
        }

        self.settled.notify_waiters();
    }
}

/// Delivers outcomes of concurrent operations in the order they finish.
///
/// Failures are handed to the consumer as `Err` unless the sequencer was
/// built with [`CompletionSequencer::ignoring_errors`], in which case they
/// still occupy a slot but read back as `Ok(None)`. A panicking operation
/// settles as `Err(E::from(join_error))`.
pub struct CompletionSequencer<T, E> {
    shared: Arc<Shared<T, E>>,
    log: tokio::sync::Mutex<mpsc::UnboundedReceiver<Slot<T, E>>>,
}

impl<T, E> CompletionSequencer<T, E>
where
    T: Send + 'static,
    E: From<JoinError> + Send + 'static,
{
    pub fn new() -> Self {
        Self::with_mode(false)
    }

    /// Failures become absent slots instead of errors.
    pub fn ignoring_errors() -> Self {
        Self::with_mode(true)
    }

    fn with_mode(ignore_errors: bool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                counts: Mutex::new(Counts::default()),
                log: tx,
                settled: Notify::new(),
                ignore_errors,
            }),
            log: tokio::sync::Mutex::new(rx),
        }
    }

    /// Start tracking `operation`. It is spawned immediately on the current
    /// runtime.
    pub fn register<F>(&self, operation: F)
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.shared.counts().pending += 1;

        let shared = self.shared.clone();
        let task = tokio::spawn(operation);
        tokio::spawn(async move {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(join) => Err(E::from(join)),
            };
            shared.settle(outcome);
        });
    }

    /// Next outcome in settlement order.
    ///
    /// Waits while operations are pending and nothing is queued. Returns
    /// `Ok(None)` straight away when nothing is pending or queued. Cancel
    /// safe: dropping the future never loses an outcome.
    pub async fn fetch(&self) -> Result<Option<T>, E> {
        let mut log = self.log.lock().await;

        if self.count_total() == 0 {
            return Ok(None);
        }

        let slot = log.recv().await;
        self.shared.counts().queued -= 1;

        slot.unwrap_or(Ok(None))
    }

    /// Wait until every registered operation has settled. Outcomes stay
    /// queued for [`fetch`](Self::fetch).
    pub async fn wait_all(&self) {
        loop {
            let notified = self.shared.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.count_pending() == 0 {
                return;
            }

            notified.await;
        }
    }

    /// Operations still running.
    pub fn count_pending(&self) -> usize {
        self.shared.counts().pending
    }

    /// Settled outcomes not fetched yet.
    pub fn count_queued(&self) -> usize {
        self.shared.counts().queued
    }

    /// `pending + queued`.
    pub fn count_total(&self) -> usize {
        let counts = self.shared.counts();
        counts.pending + counts.queued
    }
}

impl<T, E> Default for CompletionSequencer<T, E>
where
    T: Send + 'static,
    E: From<JoinError> + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> core::fmt::Debug for CompletionSequencer<T, E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let counts = self.shared.counts();
        f.debug_struct("CompletionSequencer")
            .field("pending", &counts.pending)
            .field("queued", &counts.queued)
            .field("ignore_errors", &self.shared.ignore_errors)
            .finish()
    }
}
