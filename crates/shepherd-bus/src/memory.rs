//! In-process bus
//!
//! Delivers synchronously to every local subscriber. Used by tests and when
//! the control plane and agents share one process.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use crate::error::BusError;
use crate::message::{BusMessage, Subscription};
use crate::registry::Registry;
use crate::traits::MessageBus;

/// Bus backed by in-memory channels
#[derive(Clone, Default)]
pub struct InMemoryBus {
    registry: Arc<Registry>,
}

impl InMemoryBus {
    /// Create an empty bus
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn deliver(&self, msg: BusMessage) {
        let delivered = self.registry.deliver(&msg);
        trace!(topic = %msg.topic, delivered, "in-memory publish");
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.deliver(BusMessage::new(topic, payload));
        Ok(())
    }

    async fn publish_with_reply(
        &self,
        topic: &str,
        reply_to: &str,
        payload: Vec<u8>,
    ) -> Result<(), BusError> {
        self.deliver(BusMessage {
            topic: topic.to_string(),
            reply_to: Some(reply_to.to_string()),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        let added = self.registry.add(topic);
        let registry = Arc::clone(&self.registry);
        let owned_topic = topic.to_string();
        let id = added.id;

        Ok(Subscription::new(topic, added.rx, move || {
            registry.remove(&owned_topic, id);
        }))
    }
}
