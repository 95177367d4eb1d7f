//! Deploy state machine
//!
//! Each deploy runs as its own task: send and wait for the agent's ack with
//! retries, then wait for exactly one terminal outcome. Every state-affecting
//! mutation is broadcast as a [`DeployEvent`] and mirrored into a `watch`
//! snapshot that [`DeployHandle`] waits on.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use kameo::actor::ActorRef;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, info, warn};

use shepherd_api::{
    Deploy, DeployEvent, DeployEventKind, DeployState, Envelope, PayloadCipher, Playbook, topics,
};
use shepherd_bus::{BusError, BusMessage, MessageBus, Subscription};

use crate::actor::{FleetActor, HostActor};
use crate::config::DeployPolicy;
use crate::error::CoreError;
use crate::message::{DeploymentUpdate, RecordDeployment, ReleaseDeploy, RunningDeploys};

/// Observer for one running deploy
#[derive(Debug, Clone)]
pub struct DeployHandle {
    id: String,
    host: String,
    state: watch::Receiver<Deploy>,
}

impl DeployHandle {
    /// Deploy id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Target host
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Latest snapshot
    #[must_use]
    pub fn snapshot(&self) -> Deploy {
        self.state.borrow().clone()
    }

    /// Whether the deploy has not finished yet
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.borrow().is_running()
    }

    /// Wait until the agent acked or the deploy failed first
    pub async fn acked(&self) -> Deploy {
        self.wait(Deploy::is_acked_or_failed).await
    }

    /// Wait until the deploy reaches a terminal state
    pub async fn finished(&self) -> Deploy {
        self.wait(|d| !d.is_running()).await
    }

    /// Wait for the ack, turning a failure before it into an error
    ///
    /// # Errors
    /// Returns [`CoreError::NotAcknowledged`] if the deploy ended without an ack
    pub async fn wait_acked(&self) -> Result<Deploy, CoreError> {
        let deploy = self.acked().await;
        if deploy.acked_at.is_some() {
            return Ok(deploy);
        }
        Err(CoreError::NotAcknowledged {
            deploy: deploy.id,
            reason: deploy.error.unwrap_or_else(|| deploy.state.to_string()),
        })
    }

    async fn wait(&self, done: impl Fn(&Deploy) -> bool) -> Deploy {
        let mut rx = self.state.clone();
        if let Ok(deploy) = rx.wait_for(|d| done(d)).await {
            return deploy.clone();
        }
        // The machine is gone; its last snapshot is final
        rx.borrow().clone()
    }
}

/// Wait on an event stream for the final snapshots of the deploys in `ids`
///
/// The snapshots come from the `Finished` events themselves, so they do not
/// depend on the deploy writer having saved them yet. If the stream lagged,
/// deploys that are no longer running are dropped with a warning.
///
/// # Errors
/// Returns [`CoreError::ActorError`] if the fleet cannot be asked after a lag
pub async fn wait_finished(
    fleet: &ActorRef<FleetActor>,
    events: &mut broadcast::Receiver<DeployEvent>,
    ids: impl IntoIterator<Item = String>,
) -> Result<Vec<Deploy>, CoreError> {
    let mut pending: BTreeSet<String> = ids.into_iter().collect();
    let mut finished = Vec::with_capacity(pending.len());

    while !pending.is_empty() {
        match events.recv().await {
            Ok(event) if event.kind == DeployEventKind::Finished => {
                if pending.remove(&event.deploy.id) {
                    info!(host = %event.deploy.host, state = %event.deploy.state, "deploy finished");
                    finished.push(event.deploy);
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "missed deploy events");
                let running = fleet
                    .ask(RunningDeploys)
                    .await
                    .map_err(|e| CoreError::ActorError(e.to_string()))?;
                pending.retain(|id| {
                    let still_running = running.iter().any(|d| &d.id == id);
                    if !still_running {
                        warn!(deploy = %id, "finish event missed, see the deploy record");
                    }
                    still_running
                });
            }
            Err(RecvError::Closed) => break,
        }
    }

    Ok(finished)
}

/// Collaborators shared by every deploy the fleet starts
#[derive(Clone)]
pub(crate) struct DeployContext {
    pub bus: Arc<dyn MessageBus>,
    pub cipher: Arc<dyn PayloadCipher>,
    pub policy: DeployPolicy,
    pub events: broadcast::Sender<DeployEvent>,
}

/// Outcome topics, subscribed once before the first dispatch
struct Outcomes {
    success: Subscription,
    error: Subscription,
}

impl Outcomes {
    /// Drop outcomes buffered before the ack; they belong to earlier jobs
    fn discard_stale(&mut self) -> usize {
        let mut dropped = 0;
        while self.success.try_recv().is_some() {
            dropped += 1;
        }
        while self.error.try_recv().is_some() {
            dropped += 1;
        }
        dropped
    }
}

/// Why an attempt produced no ack
enum Miss {
    Rejected,
    TimedOut,
    Failed(BusError),
}

/// Driver for a single deploy
pub(crate) struct DeployMachine {
    deploy: Deploy,
    playbook: Playbook,
    payload: String,
    host: ActorRef<HostActor>,
    bus: Arc<dyn MessageBus>,
    policy: DeployPolicy,
    events: broadcast::Sender<DeployEvent>,
    snapshot: watch::Sender<Deploy>,
}

impl DeployMachine {
    /// Spawn the machine for a deploy whose host claim is already held
    pub(crate) fn start(
        ctx: &DeployContext,
        id: String,
        host_name: &str,
        host: ActorRef<HostActor>,
        playbook: Playbook,
    ) -> DeployHandle {
        let mut deploy = Deploy::new(id.clone(), host_name, playbook.id.clone());
        deploy.started_at = Some(Utc::now());

        let (snapshot, state) = watch::channel(deploy.clone());
        let payload = playbook.sealed_for(ctx.cipher.as_ref(), host_name);

        let machine = Self {
            deploy,
            playbook,
            payload,
            host,
            bus: Arc::clone(&ctx.bus),
            policy: ctx.policy,
            events: ctx.events.clone(),
            snapshot,
        };
        machine.publish(DeployEventKind::Started);

        info!(deploy = %id, host = %host_name, playbook = %machine.playbook.id, "deploy started");
        tokio::spawn(machine.run());

        DeployHandle {
            id,
            host: host_name.to_string(),
            state,
        }
    }

    async fn run(mut self) {
        let started = Instant::now();
        let mut remaining = self.policy.retries;
        let mut outcomes = None;
        let mut attempt = 0u32;

        let (ack, mut outcomes) = loop {
            attempt += 1;
            let attempt_start = Instant::now();
            self.mark_sent(attempt).await;

            let subscribed = match outcomes.take() {
                Some(subs) => Ok(subs),
                None => self.subscribe_outcomes().await,
            };
            let miss = match subscribed {
                Ok(subs) => match self.request().await {
                    Ok(reply) => break (reply, subs),
                    Err(miss) => {
                        outcomes = Some(subs);
                        miss
                    }
                },
                Err(e) => Miss::Failed(e),
            };

            match miss {
                Miss::TimedOut => {
                    debug!(deploy = %self.deploy.id, attempt, "no ack within attempt timeout");
                }
                Miss::Rejected => {
                    warn!(deploy = %self.deploy.id, attempt, "agent rejected dispatch");
                    sleep_until(attempt_start + self.policy.attempt_timeout).await;
                }
                Miss::Failed(e) => {
                    warn!(deploy = %self.deploy.id, attempt, error = %e, "dispatch failed");
                    sleep_until(attempt_start + self.policy.attempt_timeout).await;
                }
            }

            if started.elapsed() > self.policy.abandon_after {
                self.abandon("abandoned".to_string()).await;
                return;
            }

            if self.policy.retries > 0 {
                remaining -= 1;
                if remaining == 0 {
                    self.abandon(format!("no ack after {attempt} attempts"))
                        .await;
                    return;
                }
            }
        };

        let stale = outcomes.discard_stale();
        if stale > 0 {
            debug!(deploy = %self.deploy.id, stale, "discarded outcomes of earlier jobs");
        }

        self.mark_acked(&ack).await;
        self.await_outcome(outcomes).await;
    }

    /// One request/reply round on the host's playbook topic
    async fn request(&self) -> Result<BusMessage, Miss> {
        let envelope = Envelope::new(
            self.deploy.host.clone(),
            self.playbook.id.clone(),
            self.payload.clone(),
            self.deploy.id.clone(),
        );

        match self
            .bus
            .request(
                &topics::playbook(&self.deploy.host),
                envelope.encode(),
                self.policy.attempt_timeout,
            )
            .await
        {
            Ok(reply) if reply.payload.is_empty() => Err(Miss::Rejected),
            Ok(reply) => Ok(reply),
            Err(e) if e.is_timeout() => Err(Miss::TimedOut),
            Err(e) => Err(Miss::Failed(e)),
        }
    }

    async fn subscribe_outcomes(&self) -> Result<Outcomes, BusError> {
        let host = &self.deploy.host;
        Ok(Outcomes {
            success: self.bus.subscribe(&topics::playbook_success(host)).await?,
            error: self.bus.subscribe(&topics::playbook_error(host)).await?,
        })
    }

    async fn await_outcome(&mut self, mut outcomes: Outcomes) {
        tokio::select! {
            msg = outcomes.success.recv() => match msg {
                Some(msg) => self.succeed(msg.text()).await,
                None => self.fail("bus closed".to_string(), None).await,
            },
            msg = outcomes.error.recv() => match msg {
                Some(msg) => self.fail("host error".to_string(), Some(msg.text())).await,
                None => self.fail("bus closed".to_string(), None).await,
            },
            () = sleep(self.policy.completion_timeout) => {
                self.fail("timeout".to_string(), None).await;
            }
        }

        outcomes.success.unsubscribe();
        outcomes.error.unsubscribe();
    }

    async fn mark_sent(&mut self, attempt: u32) {
        let at = Utc::now();
        self.transition(DeployState::Sent);
        self.deploy.sent_at = Some(at);
        self.deploy.attempts = attempt;

        self.record(DeploymentUpdate::Sent {
            playbook: self.playbook.id.clone(),
            at,
        })
        .await;
        self.publish(DeployEventKind::Sent { attempt });
    }

    async fn mark_acked(&mut self, ack: &BusMessage) {
        let at = Utc::now();
        let checksum = ack.text();
        let expected = self.playbook.checksum();
        if checksum != expected {
            warn!(
                deploy = %self.deploy.id,
                host = %self.deploy.host,
                got = %checksum,
                expected = %expected,
                "ack checksum does not match playbook"
            );
        }

        self.transition(DeployState::Acked);
        self.deploy.acked_at = Some(at);
        self.deploy.ack_checksum = Some(checksum);

        self.record(DeploymentUpdate::Acked {
            playbook: self.playbook.id.clone(),
            at,
        })
        .await;
        info!(deploy = %self.deploy.id, host = %self.deploy.host, attempts = self.deploy.attempts, "deploy acked");
        self.publish(DeployEventKind::Acked);
    }

    async fn succeed(&mut self, output: String) {
        let at = Utc::now();
        self.transition(DeployState::Success);
        self.deploy.success_at = Some(at);
        self.deploy.output = Some(output);

        info!(deploy = %self.deploy.id, host = %self.deploy.host, "deploy succeeded");
        self.finish(DeploymentUpdate::Succeeded {
            playbook: self.playbook.id.clone(),
            at,
        })
        .await;
    }

    async fn fail(&mut self, reason: String, output: Option<String>) {
        let at = Utc::now();
        self.transition(DeployState::Error);
        self.deploy.error_at = Some(at);
        self.deploy.output = output;

        warn!(deploy = %self.deploy.id, host = %self.deploy.host, reason = %reason, "deploy failed");
        self.deploy.error = Some(reason);
        self.finish(DeploymentUpdate::Failed {
            playbook: self.playbook.id.clone(),
            at,
        })
        .await;
    }

    async fn abandon(&mut self, reason: String) {
        let at = Utc::now();
        self.transition(DeployState::Abandoned);
        self.deploy.error_at = Some(at);

        warn!(
            deploy = %self.deploy.id,
            host = %self.deploy.host,
            attempts = self.deploy.attempts,
            reason = %reason,
            "deploy abandoned"
        );
        self.deploy.error = Some(reason);
        self.finish(DeploymentUpdate::Abandoned { at }).await;
    }

    async fn finish(&mut self, update: DeploymentUpdate) {
        self.deploy.finished_at = Some(Utc::now());
        self.record(update).await;

        if let Err(e) = self
            .host
            .ask(ReleaseDeploy {
                deploy: self.deploy.id.clone(),
            })
            .await
        {
            warn!(deploy = %self.deploy.id, error = %e, "failed to release host claim");
        }

        self.publish(DeployEventKind::Finished);
    }

    fn transition(&mut self, next: DeployState) {
        if !self.deploy.state.can_transition_to(next) {
            warn!(
                deploy = %self.deploy.id,
                from = %self.deploy.state,
                to = %next,
                "unexpected deploy transition"
            );
        }
        self.deploy.state = next;
    }

    async fn record(&self, update: DeploymentUpdate) {
        if let Err(e) = self.host.ask(RecordDeployment(update)).await {
            warn!(
                deploy = %self.deploy.id,
                host = %self.deploy.host,
                error = %CoreError::from(e),
                "failed to record host deployment state"
            );
        }
    }

    fn publish(&self, kind: DeployEventKind) {
        self.snapshot.send_replace(self.deploy.clone());
        // No subscribers is fine
        let _ = self.events.send(DeployEvent {
            kind,
            deploy: self.deploy.clone(),
        });
    }
}
