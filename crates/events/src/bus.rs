//! Event publishing/subscription abstraction (mechanics only).
//!
//! Listeners observe the worker through this bus instead of registering
//! callbacks: each subscriber owns a channel and receives every event
//! published after it subscribed.
//!
//! ## Delivery guarantees
//!
//! - **Best-effort**: publishing never blocks the engine and never fails
//!   because a listener is slow or gone.
//! - **Per-listener order**: a subscriber receives events in emission order.
//! - **No persistence**: the job store is the source of truth; events are a
//!   view of it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::TryRecvError;

/// Error returned by [`Subscription::recv_timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvTimeoutError {
    /// No event arrived within the timeout.
    Timeout,
    /// The bus was dropped and every queued event was consumed.
    Disconnected,
}

/// A subscription to an event stream.
///
/// ## Usage pattern
///
/// ```ignore
/// let mut events = worker.subscribe();
///
/// while let Some(event) = events.recv().await {
///     if matches!(event, WorkerEvent::Closed) {
///         break;
///     }
/// }
/// ```
///
/// Subscriptions are single-consumer; hand events to other tasks through
/// your own channel if several consumers need them.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: UnboundedReceiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: UnboundedReceiver<M>) -> Self {
        Self { receiver }
    }

    /// Wait for the next message; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    /// Try to receive a message without waiting.
    pub fn try_recv(&mut self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Wait up to `timeout` for the next message.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        match tokio::time::timeout(timeout, self.receiver.recv()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(RecvTimeoutError::Disconnected),
            Err(_) => Err(RecvTimeoutError::Timeout),
        }
    }

    /// Drain everything currently queued.
    pub fn drain(&mut self) -> Vec<M> {
        let mut out = Vec::new();
        while let Ok(message) = self.receiver.try_recv() {
            out.push(message);
        }
        out
    }
}

/// Transport-agnostic event bus.
///
/// `publish` is synchronous and must not block: it is called from the
/// engine's hot path.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
