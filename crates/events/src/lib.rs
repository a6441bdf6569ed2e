//! Worker lifecycle events and the channel bus that delivers them.

pub mod bus;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, RecvTimeoutError, Subscription};
pub use event::{EventKind, WorkerEvent};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
