//! shepherd-bus: Message bus abstraction
//!
//! Provides the `MessageBus` trait with an in-process implementation for tests
//! and single-process setups, and an MQTT v5 implementation for real brokers.

pub mod error;
pub mod memory;
pub mod message;
pub mod mqtt;
mod registry;
pub mod traits;

pub use error::BusError;
pub use memory::InMemoryBus;
pub use message::{BusMessage, Subscription};
pub use mqtt::{MqttBus, MqttConfig};
pub use traits::MessageBus;
