//! Process runtime: shutdown coordination and the event bus.

pub mod event_bus;
pub mod shutdown;

pub use event_bus::{BusEvent, EventBus, TOPIC_FILLS, TOPIC_SHUTDOWN, TOPIC_SNAPSHOTS};
pub use shutdown::{
    watch_flag, Beat, JoinConfig, ShutdownCoordinator, ShutdownRequest, ShutdownStatus, Stoppable,
};
