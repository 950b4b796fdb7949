pub mod structured;

pub use structured::{
    ConnectionEvent, Event, EventBus, HealthEvent, MemoryEventBus, NoopEventBus, SelectionEvent,
};
