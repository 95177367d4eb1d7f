//! Message bus trait

use std::time::Duration;

use async_trait::async_trait;
use shepherd_api::topics;
use tracing::debug;

use crate::error::BusError;
use crate::message::{BusMessage, Subscription};

/// Publish/subscribe transport addressed by topic strings
///
/// Delivery is at-least-once; handlers must tolerate duplicates.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Fire-and-forget publish
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Publish asking for a reply on `reply_to`
    async fn publish_with_reply(
        &self,
        topic: &str,
        reply_to: &str,
        payload: Vec<u8>,
    ) -> Result<(), BusError>;

    /// Subscribe to an exact topic
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError>;

    /// Publish and wait up to `timeout` for the first reply
    async fn request(
        &self,
        topic: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<BusMessage, BusError> {
        let inbox = format!("{}.{}", topics::INBOX_PREFIX, uuid::Uuid::new_v4().simple());
        let mut replies = self.subscribe(&inbox).await?;

        self.publish_with_reply(topic, &inbox, payload).await?;
        debug!(topic, inbox = %inbox, ?timeout, "request sent");

        match tokio::time::timeout(timeout, replies.recv()).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(BusError::Closed),
            Err(_) => Err(BusError::Timeout {
                topic: topic.to_string(),
                timeout,
            }),
        }
    }
}
