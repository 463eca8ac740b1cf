//! Events published by the stack

mod events;

pub use events::{AvdeccEvent, DepartureReason, EventBus, EventFilter};
