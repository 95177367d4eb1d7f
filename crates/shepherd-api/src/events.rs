//! Deploy lifecycle events

use serde::{Deserialize, Serialize};

use crate::model::Deploy;

/// What happened to a deploy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeployEventKind {
    /// Deploy accepted and its host claimed
    Started,
    /// Dispatch attempt published
    Sent { attempt: u32 },
    /// Agent acknowledged receipt
    Acked,
    /// Deploy reached a terminal state
    Finished,
}

/// A state-affecting mutation, carrying the deploy snapshot taken right after it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployEvent {
    pub kind: DeployEventKind,
    pub deploy: Deploy,
}
