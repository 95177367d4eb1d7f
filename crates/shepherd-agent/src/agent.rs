//! Agent executor
//!
//! Answers discovery pings and runs dispatched playbooks one at a time.
//! Every job is acked with the payload checksum before it runs, and reports
//! exactly one outcome on the host's success or error topic. Retried
//! dispatches of a deploy that already ran are acked again but not re-run.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use shepherd_api::{Envelope, PayloadCipher, checksum, topics};
use shepherd_bus::{BusMessage, MessageBus, Subscription};
use shepherd_exec::{JobRunner, JobSpec};

use crate::config::JobConfig;
use crate::error::AgentError;

/// Deploy ids remembered for de-duplication
const RECENT_DEPLOYS: usize = 32;

/// Bounded set of deploy ids this agent has already taken
#[derive(Default)]
struct RecentDeploys {
    ids: Mutex<VecDeque<String>>,
}

impl RecentDeploys {
    /// Record `id`; false if it was already seen
    fn insert(&self, id: &str) -> bool {
        let mut ids = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
        if ids.iter().any(|seen| seen == id) {
            return false;
        }
        if ids.len() == RECENT_DEPLOYS {
            ids.pop_front();
        }
        ids.push_back(id.to_string());
        true
    }
}

/// Unwrapped dispatch
struct Job {
    deploy: Option<String>,
    playbook: String,
}

/// One agent per managed host
pub struct Agent {
    host: String,
    bus: Arc<dyn MessageBus>,
    cipher: Arc<dyn PayloadCipher>,
    runner: Arc<JobRunner>,
    program: String,
    args: Vec<String>,
    playbook_path: PathBuf,
    recent: RecentDeploys,
}

impl Agent {
    pub fn new(
        host: impl Into<String>,
        bus: Arc<dyn MessageBus>,
        cipher: Arc<dyn PayloadCipher>,
        job: &JobConfig,
    ) -> Self {
        Self {
            host: host.into(),
            bus,
            cipher,
            runner: Arc::new(JobRunner::new(Duration::from_secs(job.cancel_grace_secs))),
            program: job.program.clone(),
            args: job.args.clone(),
            playbook_path: job.playbook_path.clone(),
            recent: RecentDeploys::default(),
        }
    }

    /// Host identity this agent answers for
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Serve pings and jobs until `shutdown` fires
    ///
    /// Shutdown cancels the running job; its failure is still reported
    /// before this returns.
    ///
    /// # Errors
    /// Returns [`AgentError::Bus`] if the subscriptions cannot be set up
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), AgentError> {
        let pings = self.bus.subscribe(topics::PING).await?;
        let mut jobs = self.bus.subscribe(&topics::playbook(&self.host)).await?;
        info!(host = %self.host, "agent ready");

        let liveness = tokio::spawn(answer_pings(
            Arc::clone(&self.bus),
            self.host.clone(),
            pings,
            shutdown.clone(),
        ));

        let canceller = {
            let runner = Arc::clone(&self.runner);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                match runner.cancel().await {
                    Ok(true) => info!("running job cancelled"),
                    Ok(false) => {}
                    Err(e) => error!(error = %e, "failed to cancel running job"),
                }
            })
        };

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                msg = jobs.recv() => match msg {
                    Some(msg) => self.handle_job(msg).await,
                    None => {
                        warn!("job subscription closed");
                        break;
                    }
                },
            }
        }

        jobs.unsubscribe();
        liveness.abort();
        canceller.abort();
        info!(host = %self.host, "agent stopped");
        Ok(())
    }

    #[instrument(skip_all, fields(host = %self.host))]
    async fn handle_job(&self, msg: BusMessage) {
        let Some(reply_to) = msg.reply_to.as_deref() else {
            warn!("dispatch without a reply topic, ignoring");
            return;
        };

        let Some(job) = self.unwrap_job(&msg.payload) else {
            // Empty reply tells the dispatcher this attempt was not accepted
            self.publish(reply_to, Vec::new()).await;
            return;
        };

        let ack = checksum(job.playbook.as_bytes()).into_bytes();
        if let Some(deploy) = job.deploy.as_deref()
            && !self.recent.insert(deploy)
        {
            info!(deploy, "deploy already taken, acking without running");
            self.publish(reply_to, ack).await;
            return;
        }

        self.publish(reply_to, ack).await;

        match self.execute(&job.playbook).await {
            Ok(output) => {
                self.publish(&topics::playbook_success(&self.host), output)
                    .await;
            }
            Err(output) => {
                self.publish(&topics::playbook_error(&self.host), output)
                    .await;
            }
        }
    }

    /// Decode the envelope and open its payload
    fn unwrap_job(&self, data: &[u8]) -> Option<Job> {
        let envelope = match Envelope::decode(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "dropping malformed dispatch");
                return None;
            }
        };

        let Some(sealed) = envelope.payload else {
            warn!(deploy = ?envelope.deploy, "dispatch without payload");
            return None;
        };

        match self.cipher.open(&self.host, &sealed) {
            Ok(playbook) => {
                info!(
                    deploy = ?envelope.deploy,
                    playbook = ?envelope.playbook,
                    "job received"
                );
                Some(Job {
                    deploy: envelope.deploy,
                    playbook,
                })
            }
            Err(e) => {
                warn!(deploy = ?envelope.deploy, error = %e, "cannot open payload");
                None
            }
        }
    }

    /// Run the playbook; `Ok` carries output of a successful run, `Err`
    /// the output or reason of a failed one
    async fn execute(&self, playbook: &str) -> Result<Vec<u8>, Vec<u8>> {
        if let Some(dir) = self.playbook_path.parent()
            && !dir.as_os_str().is_empty()
            && let Err(e) = tokio::fs::create_dir_all(dir).await
        {
            error!(path = %dir.display(), error = %e, "cannot create playbook directory");
            return Err(e.to_string().into_bytes());
        }
        if let Err(e) = tokio::fs::write(&self.playbook_path, playbook).await {
            error!(path = %self.playbook_path.display(), error = %e, "cannot write playbook");
            return Err(e.to_string().into_bytes());
        }

        let spec = JobSpec::new(&self.program)
            .arg(self.playbook_path.to_string_lossy())
            .args(&self.args);

        match self.runner.run(&spec).await {
            Ok(out) if out.success() => Ok(out.output),
            Ok(out) => Err(out.output),
            Err(e) => Err(e.to_string().into_bytes()),
        }
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) {
        if let Err(e) = self.bus.publish(topic, payload).await {
            error!(topic, error = %e, "publish failed");
        }
    }
}

async fn answer_pings(
    bus: Arc<dyn MessageBus>,
    host: String,
    mut pings: Subscription,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            ping = pings.recv() => {
                if ping.is_none() {
                    return;
                }
                debug!(host = %host, "ping");
                if let Err(e) = bus.publish(topics::PONG, host.clone().into_bytes()).await {
                    warn!(error = %e, "failed to answer ping");
                }
            }
        }
    }
}
