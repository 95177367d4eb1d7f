//! Deploy event persistence
//!
//! Saves the deploy snapshot carried by every event, so the store follows
//! each state machine without the machine knowing about storage.

use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use shepherd_api::{Deploy, DeployEvent};

use crate::store::Collection;

/// Persist deploy snapshots until the event channel closes
pub fn spawn_deploy_writer(
    deploys: Arc<dyn Collection<Deploy>>,
    mut events: broadcast::Receiver<DeployEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Err(e) = deploys.save(&event.deploy).await {
                        error!(deploy = %event.deploy.id, error = %e, "failed to persist deploy");
                    } else {
                        debug!(deploy = %event.deploy.id, kind = ?event.kind, state = %event.deploy.state, "deploy persisted");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "deploy writer lagged; later snapshots will catch up");
                }
                Err(RecvError::Closed) => {
                    info!("deploy event stream closed");
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use shepherd_api::{DeployEventKind, DeployState};

    use super::*;
    use crate::store::MemoryCollection;

    #[tokio::test]
    async fn test_latest_snapshot_wins() {
        let store: Arc<dyn Collection<Deploy>> = Arc::new(MemoryCollection::<Deploy>::new());
        let (tx, rx) = broadcast::channel(16);
        let writer = spawn_deploy_writer(Arc::clone(&store), rx);

        let mut deploy = Deploy::new("d1", "web1", "base");
        tx.send(DeployEvent {
            kind: DeployEventKind::Started,
            deploy: deploy.clone(),
        })
        .unwrap();

        deploy.state = DeployState::Sent;
        deploy.attempts = 1;
        tx.send(DeployEvent {
            kind: DeployEventKind::Sent { attempt: 1 },
            deploy,
        })
        .unwrap();

        drop(tx);
        writer.await.unwrap();

        let stored = store.find("d1").await.unwrap().unwrap();
        assert_eq!(stored.state, DeployState::Sent);
        assert_eq!(stored.attempts, 1);
    }
}
