//! Message types for actor communication
//!
//! Message handlers are implemented in their respective actor modules.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kameo_macros::Reply;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use shepherd_api::{DeployEvent, Host};

// ============================================================================
// HostActor Messages
// ============================================================================

/// Record that the host answered a discovery ping
#[derive(Debug)]
pub struct Touch {
    /// When the pong was collected
    pub at: DateTime<Utc>,
}

/// Reserve the host for one deploy
#[derive(Debug)]
pub struct ClaimDeploy {
    /// Deploy id taking the claim
    pub deploy: String,
}

/// Give up a claim taken with [`ClaimDeploy`]
///
/// Ignored unless `deploy` holds the claim.
#[derive(Debug)]
pub struct ReleaseDeploy {
    /// Deploy id releasing the claim
    pub deploy: String,
}

/// A deployment-lifecycle transition to apply to the host record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentUpdate {
    /// Dispatch attempt published
    Sent {
        playbook: String,
        at: DateTime<Utc>,
    },
    /// Agent acknowledged receipt
    Acked {
        playbook: String,
        at: DateTime<Utc>,
    },
    /// Job completed successfully
    Succeeded {
        playbook: String,
        at: DateTime<Utc>,
    },
    /// Job failed or never reported back
    Failed {
        playbook: String,
        at: DateTime<Utc>,
    },
    /// No ack within the retry budget or ceiling
    Abandoned { at: DateTime<Utc> },
}

/// Apply a [`DeploymentUpdate`]
#[derive(Debug)]
pub struct RecordDeployment(pub DeploymentUpdate);

/// Get the host record and its current claim
#[derive(Debug)]
pub struct GetHost;

/// Host record as held by its owner
#[derive(Debug, Clone, Reply)]
pub struct HostView {
    /// Current record
    pub host: Host,
    /// Deploy holding the claim, if any
    pub active_deploy: Option<String>,
}

// ============================================================================
// FleetActor Messages
// ============================================================================

/// A host answered discovery
#[derive(Debug)]
pub struct HostSeen {
    /// Host identifier from the pong payload
    pub name: String,
    /// When the pong was collected
    pub at: DateTime<Utc>,
}

/// What [`HostSeen`] did to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSeenOutcome {
    /// First sighting; a record was created
    Created,
    /// Known host; only its last-seen time changed
    Touched,
}

/// Deploy a playbook to one host
#[derive(Debug)]
pub struct DeployHost {
    /// Target host name
    pub host: String,
    /// Playbook id
    pub playbook: String,
}

/// Deploy a group's playbook to every member
#[derive(Debug)]
pub struct DeployGroup {
    /// Group name
    pub group: String,
}

/// Dispatch-time result of a group deploy
///
/// Only reflects whether each deploy could be started, not how it ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Reply)]
pub struct DispatchReport {
    /// Host name to started deploy id
    pub started: BTreeMap<String, String>,
    /// Host name to reason the deploy could not start
    pub errors: BTreeMap<String, String>,
}

impl DispatchReport {
    /// Whether at least one host was started
    #[must_use]
    pub fn accepted(&self) -> bool {
        !self.started.is_empty()
    }
}

/// Deploys whose finished time is unset
#[derive(Debug)]
pub struct RunningDeploys;

/// Look up one host
#[derive(Debug)]
pub struct FindHost {
    /// Host name
    pub name: String,
}

/// List every known host
#[derive(Debug)]
pub struct ListHosts;

/// Subscribe to deploy lifecycle events
#[derive(Debug)]
pub struct Subscribe;

/// Receiver half of the deploy event stream
#[derive(Debug, Reply)]
pub struct EventStream(pub broadcast::Receiver<DeployEvent>);
