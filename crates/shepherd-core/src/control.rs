//! Deploy requests between control-plane processes
//!
//! Only one process may own a store directory. That process answers
//! [`ControlRequest`]s on [`topics::CONTROL_DEPLOY`], and short-lived CLI
//! invocations forward their deploys to it with [`forward`] instead of
//! starting a second fleet.

use std::sync::Arc;
use std::time::Duration;

use kameo::actor::ActorRef;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use shepherd_api::{Deploy, topics};
use shepherd_bus::{BusMessage, MessageBus, Subscription};

use crate::actor::FleetActor;
use crate::error::CoreError;
use crate::message::{DeployGroup, DeployHost, DispatchReport};

/// A deploy asked of the owning control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum ControlRequest {
    Host { host: String, playbook: String },
    Group { group: String },
}

/// Answer to a [`ControlRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ControlReply {
    /// The host deploy reached Acked; the owner tracks the rest
    Acked { deploy: Deploy },
    /// Dispatch-time report of a group deploy
    Dispatched { report: DispatchReport },
    /// Nothing was started, or the host deploy failed before its ack
    Failed { error: String },
}

/// Serves forwarded deploy requests against a fleet
pub struct ControlServer {
    bus: Arc<dyn MessageBus>,
    fleet: ActorRef<FleetActor>,
    requests: Subscription,
}

impl ControlServer {
    /// Subscribe to the request topic
    ///
    /// # Errors
    /// Returns [`CoreError::Bus`] if the subscription fails
    pub async fn bind(
        bus: Arc<dyn MessageBus>,
        fleet: ActorRef<FleetActor>,
    ) -> Result<Self, CoreError> {
        let requests = bus.subscribe(topics::CONTROL_DEPLOY).await?;
        Ok(Self {
            bus,
            fleet,
            requests,
        })
    }

    /// Answer requests until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) {
        let Self {
            bus,
            fleet,
            mut requests,
        } = self;
        info!(topic = topics::CONTROL_DEPLOY, "accepting forwarded deploys");

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                msg = requests.recv() => match msg {
                    Some(msg) => accept(&bus, &fleet, msg),
                    None => {
                        warn!("control subscription closed");
                        break;
                    }
                },
            }
        }

        requests.unsubscribe();
    }
}

/// Handle one request in its own task; host deploys reply only at ack
fn accept(bus: &Arc<dyn MessageBus>, fleet: &ActorRef<FleetActor>, msg: BusMessage) {
    let Some(reply_to) = msg.reply_to else {
        warn!("control request without a reply topic, ignoring");
        return;
    };
    let bus = Arc::clone(bus);
    let fleet = fleet.clone();

    tokio::spawn(async move {
        let reply = match serde_json::from_slice::<ControlRequest>(&msg.payload) {
            Ok(request) => {
                info!(request = ?request, "forwarded deploy");
                answer(&fleet, request).await
            }
            Err(e) => ControlReply::Failed {
                error: format!("malformed request: {e}"),
            },
        };

        let payload = match serde_json::to_vec(&reply) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "cannot encode control reply");
                return;
            }
        };
        if let Err(e) = bus.publish(&reply_to, payload).await {
            warn!(error = %e, "failed to answer control request");
        }
    });
}

async fn answer(fleet: &ActorRef<FleetActor>, request: ControlRequest) -> ControlReply {
    let result = match request {
        ControlRequest::Host { host, playbook } => deploy_host(fleet, host, playbook)
            .await
            .map(|deploy| ControlReply::Acked { deploy }),
        ControlRequest::Group { group } => fleet
            .ask(DeployGroup { group })
            .await
            .map(|report| ControlReply::Dispatched { report })
            .map_err(CoreError::from),
    };

    result.unwrap_or_else(|e| ControlReply::Failed {
        error: e.to_string(),
    })
}

async fn deploy_host(
    fleet: &ActorRef<FleetActor>,
    host: String,
    playbook: String,
) -> Result<Deploy, CoreError> {
    let handle = fleet.ask(DeployHost { host, playbook }).await?;
    handle.wait_acked().await
}

/// Send `request` to the control plane owning the store
///
/// # Errors
/// Returns [`CoreError::Control`] if nobody answers within `timeout` or
/// the reply cannot be decoded
pub async fn forward(
    bus: &dyn MessageBus,
    request: &ControlRequest,
    timeout: Duration,
) -> Result<ControlReply, CoreError> {
    let payload = serde_json::to_vec(request)
        .map_err(|e| CoreError::Control(format!("cannot encode request: {e}")))?;

    let reply = match bus.request(topics::CONTROL_DEPLOY, payload, timeout).await {
        Ok(reply) => reply,
        Err(e) if e.is_timeout() => {
            return Err(CoreError::Control(format!(
                "no control plane answered within {timeout:?}"
            )));
        }
        Err(e) => return Err(e.into()),
    };

    serde_json::from_slice(&reply.payload)
        .map_err(|e| CoreError::Control(format!("malformed reply: {e}")))
}
