//! Tessera node library surface

pub mod events;
pub mod node;

pub use events::{EventBus, NodeEvent};
pub use node::{HealthReport, Node, NodeBuilder};
