// crates/relaycore/src/events/mod.rs

mod bus;

pub use bus::{EventPublisher, EventSubscription, RunEvent};
