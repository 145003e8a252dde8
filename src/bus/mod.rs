//! Event Buses
//!
//! Two fan-out paths: an in-process topic bus for lifecycle events and a
//! Redis-backed cross-node bus so every node can broadcast to its own
//! sessions.

pub mod cross_node;
pub mod event_bus;

pub use cross_node::{CrossNodeBus, Envelope, EnvelopeHandler};
pub use event_bus::EventBus;
