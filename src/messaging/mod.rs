pub mod broker;
pub mod events;
pub mod topology;

pub use broker::{Broker, QueueConsumer, QueueMessage};
