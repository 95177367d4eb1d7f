//! MQTT v5 bus using `rumqttc`
//!
//! Reply subjects map onto the v5 `response_topic` publish property, so
//! payloads travel unmodified. A single event-loop task fans incoming
//! publishes out to local subscribers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::mqttbytes::v5::{Packet, PublishProperties};
use rumqttc::v5::{AsyncClient, Event, EventLoop, MqttOptions};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::BusError;
use crate::message::{BusMessage, Subscription};
use crate::registry::Registry;
use crate::traits::MessageBus;

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host
    #[serde(default = "default_host")]
    pub host: String,
    /// Broker port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Client identifier, must be unique per connection
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Outgoing request queue capacity
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    format!("shepherd-{}", uuid::Uuid::new_v4().simple())
}

fn default_keep_alive_secs() -> u64 {
    15
}

fn default_capacity() -> usize {
    256
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_id: default_client_id(),
            keep_alive_secs: default_keep_alive_secs(),
            capacity: default_capacity(),
        }
    }
}

/// Bus backed by an MQTT v5 broker
pub struct MqttBus {
    client: AsyncClient,
    registry: Arc<Registry>,
    task: JoinHandle<()>,
}

impl MqttBus {
    /// Start the connection event loop
    ///
    /// The connection is established lazily by the event loop and retried
    /// on failure; subscriptions are re-established after every reconnect.
    #[must_use]
    pub fn connect(config: &MqttConfig) -> Self {
        let mut opts = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        opts.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

        let (client, eventloop) = AsyncClient::new(opts, config.capacity);
        let registry = Arc::new(Registry::default());

        info!(host = %config.host, port = config.port, client_id = %config.client_id, "connecting to MQTT broker");

        let task = tokio::spawn(Self::event_loop(
            eventloop,
            client.clone(),
            Arc::clone(&registry),
        ));

        Self {
            client,
            registry,
            task,
        }
    }

    async fn event_loop(mut eventloop: EventLoop, client: AsyncClient, registry: Arc<Registry>) {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let msg = BusMessage {
                        topic: String::from_utf8_lossy(&publish.topic).into_owned(),
                        reply_to: publish.properties.and_then(|p| p.response_topic),
                        payload: publish.payload.to_vec(),
                    };
                    let delivered = registry.deliver(&msg);
                    debug!(topic = %msg.topic, delivered, "MQTT message received");
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("MQTT connected");
                    // Never await the client here: the request queue only drains
                    // while this loop polls.
                    for topic in registry.topics() {
                        if let Err(e) = client.try_subscribe(topic.clone(), QoS::AtLeastOnce) {
                            warn!(topic = %topic, error = %e, "resubscribe failed");
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "MQTT connection error, retrying");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }
}

impl Drop for MqttBus {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl MessageBus for MqttBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, Bytes::from(payload))
            .await
            .map_err(|e| BusError::PublishFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn publish_with_reply(
        &self,
        topic: &str,
        reply_to: &str,
        payload: Vec<u8>,
    ) -> Result<(), BusError> {
        let properties = PublishProperties {
            response_topic: Some(reply_to.to_string()),
            ..PublishProperties::default()
        };

        self.client
            .publish_with_properties(topic, QoS::AtLeastOnce, false, Bytes::from(payload), properties)
            .await
            .map_err(|e| BusError::PublishFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        let added = self.registry.add(topic);

        if added.first {
            if let Err(e) = self.client.subscribe(topic, QoS::AtLeastOnce).await {
                self.registry.remove(topic, added.id);
                return Err(BusError::SubscribeFailed {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                });
            }
        }

        let registry = Arc::clone(&self.registry);
        let client = self.client.clone();
        let owned_topic = topic.to_string();
        let id = added.id;

        Ok(Subscription::new(topic, added.rx, move || {
            if registry.remove(&owned_topic, id) {
                if let Err(e) = client.try_unsubscribe(owned_topic.clone()) {
                    debug!(topic = %owned_topic, error = %e, "unsubscribe not sent");
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config: MqttConfig = toml::from_str("").unwrap();

        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 1883);
        assert!(config.client_id.starts_with("shepherd-"));
    }
}
