//! Local fan-out of inbound messages to subscribers

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::message::BusMessage;

type Senders = Vec<(u64, mpsc::UnboundedSender<BusMessage>)>;

/// Subscribers keyed by exact topic
#[derive(Default)]
pub(crate) struct Registry {
    topics: Mutex<HashMap<String, Senders>>,
    next_id: AtomicU64,
}

/// A newly registered subscriber
pub(crate) struct Added {
    pub id: u64,
    pub rx: mpsc::UnboundedReceiver<BusMessage>,
    /// First local subscriber for this topic
    pub first: bool,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Senders>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, topic: &str) -> Added {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut topics = self.lock();
        let senders = topics.entry(topic.to_string()).or_default();
        let first = senders.is_empty();
        senders.push((id, tx));

        Added { id, rx, first }
    }

    /// Returns true when `topic` has no subscribers left
    pub fn remove(&self, topic: &str, id: u64) -> bool {
        let mut topics = self.lock();
        let Some(senders) = topics.get_mut(topic) else {
            return false;
        };
        senders.retain(|(sid, _)| *sid != id);
        if senders.is_empty() {
            topics.remove(topic);
            true
        } else {
            false
        }
    }

    /// Deliver to every live subscriber of `msg.topic`; returns the count
    pub fn deliver(&self, msg: &BusMessage) -> usize {
        let mut topics = self.lock();
        let Some(senders) = topics.get_mut(&msg.topic) else {
            return 0;
        };
        senders.retain(|(_, tx)| tx.send(msg.clone()).is_ok());
        senders.len()
    }

    pub fn topics(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_and_last_subscriber() {
        let registry = Registry::default();

        let a = registry.add("fleet.ping");
        let b = registry.add("fleet.ping");
        assert!(a.first);
        assert!(!b.first);

        assert!(!registry.remove("fleet.ping", a.id));
        assert!(registry.remove("fleet.ping", b.id));
        assert!(registry.topics().is_empty());
    }

    #[test]
    fn test_deliver_prunes_closed_receivers() {
        let registry = Registry::default();

        let mut live = registry.add("t");
        let dead = registry.add("t");
        drop(dead.rx);

        let delivered = registry.deliver(&BusMessage::new("t", b"x".to_vec()));
        assert_eq!(delivered, 1);
        assert_eq!(live.rx.try_recv().unwrap().payload, b"x");
    }
}
