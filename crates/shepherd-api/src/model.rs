//! Fleet record types

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checksum::checksum;
use crate::cipher::PayloadCipher;

/// Deployment state shared by `Host` and `Deploy`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployState {
    /// No deployment activity recorded
    #[default]
    New,
    /// Dispatch published, waiting for the agent's ack
    Sent,
    /// Agent confirmed receipt and is running the job
    Acked,
    /// Job completed successfully
    Success,
    /// Job failed, or never reported back after ack
    Error,
    /// Ack never arrived within the retry budget or the abandonment ceiling
    Abandoned,
}

impl DeployState {
    /// Whether no further transitions are possible
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Abandoned)
    }

    /// Whether a deploy may move from `self` to `next`
    ///
    /// `Sent -> Sent` is a retry.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::New, Self::Sent)
                | (Self::Sent, Self::Sent | Self::Acked | Self::Abandoned)
                | (Self::Acked, Self::Success | Self::Error)
        )
    }
}

impl fmt::Display for DeployState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Sent => "sent",
            Self::Acked => "acked",
            Self::Success => "success",
            Self::Error => "error",
            Self::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

/// A managed machine
///
/// Fields fall into two groups written by different actors: liveness
/// (`last_seen_at`, owned by discovery) and deployment (everything else).
/// Stores are updated per group so one writer never clobbers the other.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    pub state: DeployState,
    pub last_deployed_at: Option<DateTime<Utc>>,
    pub last_deployed_playbook: Option<String>,
    pub last_acked_at: Option<DateTime<Utc>>,
    pub last_acked_playbook: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_success_playbook: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_error_playbook: Option<String>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl Host {
    /// Fields written by discovery
    pub const LIVENESS_FIELDS: &'static [&'static str] = &["last_seen_at"];

    /// Fields written by the deploy state machine
    pub const DEPLOYMENT_FIELDS: &'static [&'static str] = &[
        "state",
        "last_deployed_at",
        "last_deployed_playbook",
        "last_acked_at",
        "last_acked_playbook",
        "last_success_at",
        "last_success_playbook",
        "last_error_at",
        "last_error_playbook",
    ];

    /// A host with no recorded activity
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// A freshly discovered host
    pub fn seen(name: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            last_seen_at: Some(at),
            ..Self::new(name)
        }
    }
}

/// Named unit of configuration-management content
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Playbook {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub data: String,
}

impl Playbook {
    pub fn new(id: impl Into<String>, data: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            data: data.into(),
        }
    }

    /// Hex SHA-256 of the content
    #[must_use]
    pub fn checksum(&self) -> String {
        checksum(self.data.as_bytes())
    }

    /// Transport payload for `host`
    #[must_use]
    pub fn sealed_for(&self, cipher: &dyn PayloadCipher, host: &str) -> String {
        cipher.seal(host, &self.data)
    }
}

/// Fan-out target list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    #[serde(default)]
    pub playbook: Option<String>,
    #[serde(default)]
    pub hosts: Vec<String>,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Add `host` unless already a member; returns whether it was added
    pub fn add_host(&mut self, host: &str) -> bool {
        if self.hosts.iter().any(|h| h == host) {
            return false;
        }
        self.hosts.push(host.to_string());
        true
    }

    /// Remove `host`; returns whether it was a member
    pub fn remove_host(&mut self, host: &str) -> bool {
        let before = self.hosts.len();
        self.hosts.retain(|h| h != host);
        self.hosts.len() != before
    }
}

/// One attempt to dispatch and run a playbook on one host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deploy {
    pub id: String,
    pub host: String,
    pub playbook: String,
    pub state: DeployState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub acked_at: Option<DateTime<Utc>>,
    pub success_at: Option<DateTime<Utc>>,
    pub error_at: Option<DateTime<Utc>>,
    /// Number of dispatch attempts made
    #[serde(default)]
    pub attempts: u32,
    /// Checksum returned by the agent in its ack
    pub ack_checksum: Option<String>,
    /// Output reported by the agent
    pub output: Option<String>,
    pub error: Option<String>,
}

impl Deploy {
    pub fn new(id: impl Into<String>, host: impl Into<String>, playbook: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            playbook: playbook.into(),
            ..Self::default()
        }
    }

    /// Still running: not yet finished
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.finished_at.is_none()
    }

    /// Ack received or the deploy already failed
    #[must_use]
    pub fn is_acked_or_failed(&self) -> bool {
        self.acked_at.is_some() || self.error_at.is_some() || self.state.is_terminal()
    }
}

/// API access key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    pub name: String,
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}
