//! Host discovery
//!
//! Broadcasts a ping, collects pongs for a fixed window and reconciles the
//! answering host names into the fleet registry.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use kameo::actor::ActorRef;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use shepherd_api::topics;
use shepherd_bus::MessageBus;

use crate::actor::FleetActor;
use crate::config::DiscoveryConfig;
use crate::error::CoreError;
use crate::message::{HostSeen, HostSeenOutcome};

/// What one discovery cycle found
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Every distinct host that answered
    pub seen: BTreeSet<String>,
    /// Hosts answering for the first time
    pub created: Vec<String>,
    /// Hosts whose record could not be updated
    pub failed: Vec<String>,
}

/// Periodic ping/pong liveness sweep
pub struct Discovery {
    bus: Arc<dyn MessageBus>,
    fleet: ActorRef<FleetActor>,
    config: DiscoveryConfig,
}

impl Discovery {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        fleet: ActorRef<FleetActor>,
        config: DiscoveryConfig,
    ) -> Self {
        Self { bus, fleet, config }
    }

    /// Run cycles on the configured interval until `shutdown` fires
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("discovery stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            match self.cycle().await {
                Ok(report) => debug!(
                    seen = report.seen.len(),
                    created = report.created.len(),
                    failed = report.failed.len(),
                    "discovery cycle finished"
                ),
                Err(e) => warn!(error = %e, "discovery cycle failed"),
            }
        }
    }

    /// One ping, one collection window, one reconcile pass
    ///
    /// # Errors
    /// Returns [`CoreError::Bus`] if the pong topic cannot be subscribed.
    /// Per-host failures are logged and reported, never returned.
    pub async fn cycle(&self) -> Result<DiscoveryReport, CoreError> {
        let seen = self.collect().await?;

        let mut report = DiscoveryReport::default();
        let at = Utc::now();
        for name in &seen {
            let outcome = self
                .fleet
                .ask(HostSeen {
                    name: name.clone(),
                    at,
                })
                .await
                .map_err(CoreError::from);

            match outcome {
                Ok(HostSeenOutcome::Created) => report.created.push(name.clone()),
                Ok(HostSeenOutcome::Touched) => {}
                Err(e) => {
                    warn!(host = %name, error = %e, "failed to record discovered host");
                    report.failed.push(name.clone());
                }
            }
        }
        report.seen = seen;

        Ok(report)
    }

    async fn collect(&self) -> Result<BTreeSet<String>, CoreError> {
        let mut pongs = self.bus.subscribe(topics::PONG).await?;

        // Publish after a delay so the subscription above is live at the broker
        let bus = Arc::clone(&self.bus);
        let delay = self.config.ping_delay;
        let ping = tokio::spawn(async move {
            sleep(delay).await;
            if let Err(e) = bus.publish(topics::PING, Vec::new()).await {
                warn!(error = %e, "failed to publish discovery ping");
            }
        });

        let deadline = Instant::now() + self.config.window;
        let mut seen = BTreeSet::new();
        while let Ok(Some(pong)) = timeout_at(deadline, pongs.recv()).await {
            let name = pong.text();
            let name = name.trim();
            if name.is_empty() {
                debug!("ignoring empty pong");
                continue;
            }
            seen.insert(name.to_string());
        }

        pongs.unsubscribe();
        ping.abort();

        Ok(seen)
    }
}
