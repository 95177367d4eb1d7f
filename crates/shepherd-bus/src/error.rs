//! Error types for shepherd-bus

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur talking to the bus
#[derive(Error, Debug, Clone)]
pub enum BusError {
    /// Broker connection failed or was lost
    #[error("bus connection failed: {0}")]
    ConnectionFailed(String),

    /// Publish could not be queued
    #[error("publish to {topic} failed: {reason}")]
    PublishFailed {
        /// Target topic
        topic: String,
        /// Underlying reason
        reason: String,
    },

    /// Subscribe could not be queued
    #[error("subscribe to {topic} failed: {reason}")]
    SubscribeFailed {
        /// Topic being subscribed
        topic: String,
        /// Underlying reason
        reason: String,
    },

    /// No reply within the request timeout
    #[error("no reply on {topic} within {timeout:?}")]
    Timeout {
        /// Request topic
        topic: String,
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// The bus was shut down
    #[error("bus closed")]
    Closed,
}

impl BusError {
    /// Whether this is a request/reply timeout
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, BusError::Timeout { .. })
    }
}
