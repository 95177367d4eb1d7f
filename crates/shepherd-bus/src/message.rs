//! Inbound messages and subscription handles

use tokio::sync::mpsc;

/// A message delivered from the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Topic the message was published on
    pub topic: String,
    /// Topic the publisher expects a reply on, if any
    pub reply_to: Option<String>,
    /// Raw payload
    pub payload: Vec<u8>,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            reply_to: None,
            payload: payload.into(),
        }
    }

    /// Payload as lossy UTF-8
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Unbounded inbound stream for one topic
///
/// Dropping the subscription (or calling [`Subscription::unsubscribe`])
/// removes it from the bus.
pub struct Subscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<BusMessage>,
    on_cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wrap a receiver with the bus-specific cancel action
    pub fn new(
        topic: impl Into<String>,
        rx: mpsc::UnboundedReceiver<BusMessage>,
        on_cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            topic: topic.into(),
            rx,
            on_cancel: Some(Box::new(on_cancel)),
        }
    }

    /// Subscribed topic
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wait for the next message; `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }

    /// Take an already buffered message without waiting
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        self.rx.try_recv().ok()
    }

    /// Stop receiving
    pub fn unsubscribe(mut self) {
        self.cancel();
    }

    fn cancel(&mut self) {
        if let Some(on_cancel) = self.on_cancel.take() {
            on_cancel();
        }
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}
