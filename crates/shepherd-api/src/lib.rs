//! shepherd-api: Shared wire and record types
//!
//! Contains the fleet data model, the dispatch envelope, bus topic names and
//! deploy events used across the control plane, the agent and the store.

pub mod checksum;
pub mod cipher;
pub mod envelope;
pub mod events;
pub mod model;
pub mod topics;

pub use checksum::checksum;
pub use cipher::{CipherError, PayloadCipher, PlainText};
pub use envelope::{Envelope, EnvelopeError};
pub use events::{DeployEvent, DeployEventKind};
pub use model::{Deploy, DeployState, Group, Host, Key, Playbook};
