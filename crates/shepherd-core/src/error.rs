//! Core error types for shepherd-core

use kameo::error::SendError;
use thiserror::Error;

use shepherd_bus::BusError;

use crate::store::RecordKind;

/// Errors raised by a persistence collection
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Record does not exist
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Record kind
        kind: RecordKind,
        /// Natural identifier
        id: String,
    },

    /// Record could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Backing storage failed
    #[error("storage I/O error: {0}")]
    Io(String),

    /// Another process owns the store directory
    #[error("store directory {0} is held by another process")]
    Locked(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

/// Errors that can occur in core fleet operations
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    /// Host not found in registry or store
    #[error("host not found: {0}")]
    HostNotFound(String),

    /// Playbook not found in store
    #[error("playbook not found: {0}")]
    PlaybookNotFound(String),

    /// Group not found in store
    #[error("group not found: {0}")]
    GroupNotFound(String),

    /// Key not found in store
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// A key with this name already exists
    #[error("key already exists: {0}")]
    KeyExists(String),

    /// Group cannot be dispatched without a playbook
    #[error("group {0} does not have a playbook assigned")]
    NoPlaybookAssigned(String),

    /// Group has no member hosts
    #[error("group {0} has no hosts")]
    EmptyGroup(String),

    /// Another deploy is already driving this host
    #[error("host {host} is busy with deploy {deploy}")]
    DeployInProgress {
        /// Host name
        host: String,
        /// Active deploy id
        deploy: String,
    },

    /// Deploy failed before the agent acknowledged it
    #[error("deploy {deploy} was not acknowledged: {reason}")]
    NotAcknowledged {
        /// Deploy id
        deploy: String,
        /// Failure reason recorded on the deploy
        reason: String,
    },

    /// Persistence failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Message bus failure
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// Actor communication error
    #[error("actor communication error: {0}")]
    ActorError(String),

    /// Forwarded request could not be completed
    #[error("control request failed: {0}")]
    Control(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl<M> From<SendError<M, CoreError>> for CoreError {
    fn from(err: SendError<M, CoreError>) -> Self {
        match err {
            SendError::HandlerError(e) => e,
            other => CoreError::ActorError(other.to_string()),
        }
    }
}
