//! Company change events and the publishing contract.

pub mod bus;
pub mod change_event;
pub mod dedup;
pub mod in_memory_bus;

pub use bus::{EventPublisher, PublishError, Subscription};
pub use change_event::{ChangeEvent, ChangeKind, EventKey};
pub use dedup::EventDeduplicator;
pub use in_memory_bus::InMemoryEventBus;
