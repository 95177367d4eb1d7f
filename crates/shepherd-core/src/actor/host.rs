//! `HostActor`: Single owner of one host record
//!
//! Discovery and every running deploy route their writes through this actor,
//! so liveness and deployment updates are serialized per host. Each write
//! persists only the field group it changed.

use std::sync::Arc;

use kameo::actor::{ActorRef, WeakActorRef};
use kameo::error::ActorStopReason;
use kameo::message::{Context, Message};
use kameo::prelude::*;
use tracing::{debug, info, warn};

use shepherd_api::{DeployState, Host};

use crate::error::CoreError;
use crate::message::{
    ClaimDeploy, DeploymentUpdate, GetHost, HostView, RecordDeployment, ReleaseDeploy, Touch,
};
use crate::store::Collection;

/// Arguments for spawning a `HostActor`
pub struct HostActorArgs {
    /// Record as currently stored
    pub host: Host,
    /// Host collection the actor writes through
    pub store: Arc<dyn Collection<Host>>,
}

/// Per-host actor owning the host record and its deploy claim
pub struct HostActor {
    host: Host,
    store: Arc<dyn Collection<Host>>,
    /// Deploy currently driving the deployment fields
    active_deploy: Option<String>,
}

impl HostActor {
    /// Get the hostname
    #[must_use]
    pub fn name(&self) -> &str {
        &self.host.name
    }

    fn apply(&mut self, update: DeploymentUpdate) {
        let host = &mut self.host;
        match update {
            DeploymentUpdate::Sent { playbook, at } => {
                host.state = DeployState::Sent;
                host.last_deployed_at = Some(at);
                host.last_deployed_playbook = Some(playbook);
            }
            DeploymentUpdate::Acked { playbook, at } => {
                host.state = DeployState::Acked;
                host.last_acked_at = Some(at);
                host.last_acked_playbook = Some(playbook);
            }
            DeploymentUpdate::Succeeded { playbook, at } => {
                host.state = DeployState::Success;
                host.last_success_at = Some(at);
                host.last_success_playbook = Some(playbook);
            }
            DeploymentUpdate::Failed { playbook, at } => {
                host.state = DeployState::Error;
                host.last_error_at = Some(at);
                host.last_error_playbook = Some(playbook);
            }
            DeploymentUpdate::Abandoned { at } => {
                host.state = DeployState::Abandoned;
                host.last_error_at = Some(at);
                host.last_error_playbook = None;
            }
        }
    }
}

impl Actor for HostActor {
    type Args = HostActorArgs;
    type Error = CoreError;

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        debug!(host = %args.host.name, id = %actor_ref.id(), "HostActor starting");

        Ok(Self {
            host: args.host,
            store: args.store,
            active_deploy: None,
        })
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        reason: ActorStopReason,
    ) -> Result<(), Self::Error> {
        debug!(host = %self.host.name, reason = ?reason, "HostActor stopping");
        Ok(())
    }
}

// ============================================================================
// Message Handlers
// ============================================================================

impl Message<Touch> for HostActor {
    type Reply = Result<(), CoreError>;

    async fn handle(&mut self, msg: Touch, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.host.last_seen_at = Some(msg.at);
        self.store
            .save_fields(Host::LIVENESS_FIELDS, &self.host)
            .await?;

        debug!(host = %self.host.name, at = %msg.at, "host seen");
        Ok(())
    }
}

impl Message<ClaimDeploy> for HostActor {
    type Reply = Result<(), CoreError>;

    async fn handle(
        &mut self,
        msg: ClaimDeploy,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if let Some(active) = &self.active_deploy {
            return Err(CoreError::DeployInProgress {
                host: self.host.name.clone(),
                deploy: active.clone(),
            });
        }

        info!(host = %self.host.name, deploy = %msg.deploy, "deploy claimed host");
        self.active_deploy = Some(msg.deploy);
        Ok(())
    }
}

impl Message<ReleaseDeploy> for HostActor {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: ReleaseDeploy,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if self.active_deploy.as_deref() == Some(msg.deploy.as_str()) {
            self.active_deploy = None;
            info!(host = %self.host.name, deploy = %msg.deploy, "deploy released host");
        } else {
            warn!(
                host = %self.host.name,
                deploy = %msg.deploy,
                active = ?self.active_deploy,
                "release from a deploy that does not hold the claim"
            );
        }
    }
}

impl Message<RecordDeployment> for HostActor {
    type Reply = Result<(), CoreError>;

    async fn handle(
        &mut self,
        msg: RecordDeployment,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let from = self.host.state;
        self.apply(msg.0);

        info!(
            host = %self.host.name,
            from = %from,
            to = %self.host.state,
            "host deployment state"
        );

        self.store
            .save_fields(Host::DEPLOYMENT_FIELDS, &self.host)
            .await?;
        Ok(())
    }
}

impl Message<GetHost> for HostActor {
    type Reply = HostView;

    async fn handle(&mut self, _msg: GetHost, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        HostView {
            host: self.host.clone(),
            active_deploy: self.active_deploy.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::store::MemoryCollection;

    async fn spawn_host(name: &str) -> (ActorRef<HostActor>, Arc<dyn Collection<Host>>) {
        let store: Arc<dyn Collection<Host>> = Arc::new(MemoryCollection::<Host>::new());
        let host = Host::new(name);
        store.save(&host).await.unwrap();

        let actor = HostActor::spawn(HostActorArgs {
            host,
            store: Arc::clone(&store),
        });
        (actor, store)
    }

    #[tokio::test]
    async fn test_second_claim_is_rejected() {
        let (actor, _) = spawn_host("web1").await;

        actor
            .ask(ClaimDeploy {
                deploy: "a".to_string(),
            })
            .await
            .unwrap();

        let err = CoreError::from(
            actor
                .ask(ClaimDeploy {
                    deploy: "b".to_string(),
                })
                .await
                .unwrap_err(),
        );
        assert!(matches!(err, CoreError::DeployInProgress { ref deploy, .. } if deploy == "a"));
    }

    #[tokio::test]
    async fn test_release_by_other_deploy_keeps_claim() {
        let (actor, _) = spawn_host("web1").await;

        actor
            .ask(ClaimDeploy {
                deploy: "a".to_string(),
            })
            .await
            .unwrap();
        actor
            .ask(ReleaseDeploy {
                deploy: "b".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(
            actor.ask(GetHost).await.unwrap().active_deploy.as_deref(),
            Some("a")
        );

        actor
            .ask(ReleaseDeploy {
                deploy: "a".to_string(),
            })
            .await
            .unwrap();
        assert!(actor.ask(GetHost).await.unwrap().active_deploy.is_none());
    }

    #[tokio::test]
    async fn test_deployment_updates_are_persisted() {
        let (actor, store) = spawn_host("web1").await;
        let at = Utc::now();

        actor
            .ask(RecordDeployment(DeploymentUpdate::Sent {
                playbook: "base".to_string(),
                at,
            }))
            .await
            .unwrap();
        actor
            .ask(RecordDeployment(DeploymentUpdate::Acked {
                playbook: "base".to_string(),
                at,
            }))
            .await
            .unwrap();

        let stored = store.find("web1").await.unwrap().unwrap();
        assert_eq!(stored.state, DeployState::Acked);
        assert_eq!(stored.last_deployed_playbook.as_deref(), Some("base"));
        assert_eq!(stored.last_acked_at, Some(at));
        assert!(stored.last_seen_at.is_none());
    }

    #[tokio::test]
    async fn test_abandon_clears_error_playbook() {
        let (actor, _) = spawn_host("web1").await;
        let at = Utc::now();

        actor
            .ask(RecordDeployment(DeploymentUpdate::Failed {
                playbook: "base".to_string(),
                at,
            }))
            .await
            .unwrap();
        actor
            .ask(RecordDeployment(DeploymentUpdate::Abandoned { at }))
            .await
            .unwrap();

        let view = actor.ask(GetHost).await.unwrap();
        assert_eq!(view.host.state, DeployState::Abandoned);
        assert_eq!(view.host.last_error_at, Some(at));
        assert!(view.host.last_error_playbook.is_none());
    }
}
