//! `FleetActor`: Host registry and deploy dispatcher
//!
//! Owns one `HostActor` per known host and starts deploy state machines,
//! individually or fanned out across a group.

use std::collections::HashMap;
use std::sync::Arc;

use kameo::actor::{ActorRef, WeakActorRef};
use kameo::error::ActorStopReason;
use kameo::message::{Context, Message};
use kameo::prelude::*;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use shepherd_api::{Deploy, DeployEvent, Host, PayloadCipher, Playbook};
use shepherd_bus::MessageBus;

use crate::actor::host::{HostActor, HostActorArgs};
use crate::config::DeployPolicy;
use crate::deploy::{DeployContext, DeployHandle, DeployMachine};
use crate::error::CoreError;
use crate::message::{
    ClaimDeploy, DeployGroup, DeployHost, DispatchReport, EventStream, FindHost, GetHost,
    HostSeen, HostSeenOutcome, ListHosts, RunningDeploys, Subscribe, Touch,
};
use crate::store::Db;

/// Arguments for spawning a `FleetActor`
pub struct FleetActorArgs {
    /// Record store
    pub db: Db,
    /// Bus used to reach agents
    pub bus: Arc<dyn MessageBus>,
    /// Payload transform applied per host
    pub cipher: Arc<dyn PayloadCipher>,
    /// Retry and deadline policy for every deploy
    pub policy: DeployPolicy,
    /// Deploy event stream; subscribe before spawning to see every event
    pub events: broadcast::Sender<DeployEvent>,
}

/// Fleet registry and dispatcher
pub struct FleetActor {
    /// Registry of host actors by hostname
    hosts: HashMap<String, ActorRef<HostActor>>,
    db: Db,
    deploy_ctx: DeployContext,
    /// Deploys started by this actor that had not finished at last check
    deploys: Vec<DeployHandle>,
}

impl FleetActor {
    fn spawn_host_actor(&mut self, host: Host) -> ActorRef<HostActor> {
        let name = host.name.clone();
        let actor_ref = HostActor::spawn(HostActorArgs {
            host,
            store: Arc::clone(&self.db.hosts),
        });
        self.hosts.insert(name, actor_ref.clone());
        actor_ref
    }

    /// Claim the host and start a deploy; fails without side effects
    async fn start_deploy(
        &mut self,
        host: &str,
        playbook: &Playbook,
    ) -> Result<DeployHandle, CoreError> {
        let actor_ref = self
            .hosts
            .get(host)
            .cloned()
            .ok_or_else(|| CoreError::HostNotFound(host.to_string()))?;

        let id = uuid::Uuid::new_v4().simple().to_string();
        actor_ref.ask(ClaimDeploy { deploy: id.clone() }).await?;

        let handle =
            DeployMachine::start(&self.deploy_ctx, id, host, actor_ref, playbook.clone());

        self.deploys.retain(DeployHandle::is_running);
        self.deploys.push(handle.clone());
        Ok(handle)
    }

    async fn find_playbook(&self, id: &str) -> Result<Playbook, CoreError> {
        self.db
            .playbooks
            .find(id)
            .await?
            .ok_or_else(|| CoreError::PlaybookNotFound(id.to_string()))
    }
}

impl Actor for FleetActor {
    type Args = FleetActorArgs;
    type Error = CoreError;

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        let known = args.db.hosts.find_all().await?;

        info!(id = %actor_ref.id(), hosts = known.len(), "FleetActor starting");

        let mut fleet = Self {
            hosts: HashMap::new(),
            db: args.db,
            deploy_ctx: DeployContext {
                bus: args.bus,
                cipher: args.cipher,
                policy: args.policy,
                events: args.events,
            },
            deploys: Vec::new(),
        };
        for host in known {
            fleet.spawn_host_actor(host);
        }

        Ok(fleet)
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        reason: ActorStopReason,
    ) -> Result<(), Self::Error> {
        info!(reason = ?reason, "FleetActor stopping");

        for (name, actor_ref) in &self.hosts {
            info!(host = %name, "stopping HostActor");
            actor_ref.stop_gracefully().await.ok();
        }

        Ok(())
    }
}

// ============================================================================
// Message Handlers
// ============================================================================

impl Message<HostSeen> for FleetActor {
    type Reply = Result<HostSeenOutcome, CoreError>;

    async fn handle(
        &mut self,
        msg: HostSeen,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if let Some(actor_ref) = self.hosts.get(&msg.name) {
            actor_ref.ask(Touch { at: msg.at }).await?;
            return Ok(HostSeenOutcome::Touched);
        }

        let host = Host::seen(msg.name.clone(), msg.at);
        self.db.hosts.save(&host).await?;
        self.spawn_host_actor(host);

        info!(host = %msg.name, "discovered new host");
        Ok(HostSeenOutcome::Created)
    }
}

impl Message<DeployHost> for FleetActor {
    type Reply = Result<DeployHandle, CoreError>;

    async fn handle(
        &mut self,
        msg: DeployHost,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let playbook = self.find_playbook(&msg.playbook).await?;
        self.start_deploy(&msg.host, &playbook).await
    }
}

impl Message<DeployGroup> for FleetActor {
    type Reply = Result<DispatchReport, CoreError>;

    async fn handle(
        &mut self,
        msg: DeployGroup,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let group = self
            .db
            .groups
            .find(&msg.group)
            .await?
            .ok_or_else(|| CoreError::GroupNotFound(msg.group.clone()))?;

        let playbook_id = group
            .playbook
            .clone()
            .ok_or_else(|| CoreError::NoPlaybookAssigned(group.name.clone()))?;
        if group.hosts.is_empty() {
            return Err(CoreError::EmptyGroup(group.name));
        }
        let playbook = self.find_playbook(&playbook_id).await?;

        let mut report = DispatchReport::default();
        for host in &group.hosts {
            match self.start_deploy(host, &playbook).await {
                Ok(handle) => {
                    report
                        .started
                        .insert(host.clone(), handle.id().to_string());
                }
                Err(e) => {
                    warn!(group = %group.name, host = %host, error = %e, "host not dispatched");
                    report.errors.insert(host.clone(), e.to_string());
                }
            }
        }

        if report.accepted() {
            info!(
                group = %group.name,
                playbook = %playbook.id,
                started = report.started.len(),
                failed = report.errors.len(),
                "group dispatched"
            );
        } else {
            error!(group = %group.name, failed = report.errors.len(), "no host in group could be dispatched");
        }

        Ok(report)
    }
}

impl Message<RunningDeploys> for FleetActor {
    type Reply = Vec<Deploy>;

    async fn handle(
        &mut self,
        _msg: RunningDeploys,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.deploys
            .iter()
            .map(DeployHandle::snapshot)
            .filter(Deploy::is_running)
            .collect()
    }
}

impl Message<FindHost> for FleetActor {
    type Reply = Result<Host, CoreError>;

    async fn handle(
        &mut self,
        msg: FindHost,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let actor_ref = self
            .hosts
            .get(&msg.name)
            .ok_or_else(|| CoreError::HostNotFound(msg.name.clone()))?;

        actor_ref
            .ask(GetHost)
            .await
            .map(|view| view.host)
            .map_err(|e| CoreError::ActorError(e.to_string()))
    }
}

impl Message<ListHosts> for FleetActor {
    type Reply = Vec<Host>;

    async fn handle(
        &mut self,
        _msg: ListHosts,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let mut hosts = Vec::with_capacity(self.hosts.len());

        for (name, actor_ref) in &self.hosts {
            match actor_ref.ask(GetHost).await {
                Ok(view) => hosts.push(view.host),
                Err(e) => {
                    warn!(host = %name, error = %e, "failed to get host record");
                }
            }
        }

        hosts.sort_by(|a, b| a.name.cmp(&b.name));
        hosts
    }
}

impl Message<Subscribe> for FleetActor {
    type Reply = EventStream;

    async fn handle(
        &mut self,
        _msg: Subscribe,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        EventStream(self.deploy_ctx.events.subscribe())
    }
}
