use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use shepherd_agent::{Agent, AgentError, JobConfig};
use shepherd_api::{Envelope, PlainText, checksum, topics};
use shepherd_bus::{InMemoryBus, MessageBus, Subscription};

const WAIT: Duration = Duration::from_secs(10);

static NEXT_DEPLOY: AtomicUsize = AtomicUsize::new(1);

struct Running {
    bus: InMemoryBus,
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), AgentError>>,
    success: Subscription,
    error: Subscription,
    _dir: tempfile::TempDir,
}

/// Agent for `web1` that runs each playbook as a shell script
async fn start_agent() -> Running {
    let dir = tempfile::tempdir().unwrap();
    let bus = InMemoryBus::new();
    let job = JobConfig {
        program: "sh".to_string(),
        args: Vec::new(),
        playbook_path: dir.path().join("playbooks/current.yml"),
        cancel_grace_secs: 1,
    };

    let success = bus.subscribe(&topics::playbook_success("web1")).await.unwrap();
    let error = bus.subscribe(&topics::playbook_error("web1")).await.unwrap();

    let agent = Agent::new("web1", Arc::new(bus.clone()), Arc::new(PlainText), &job);
    let shutdown = CancellationToken::new();
    let task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { agent.run(shutdown).await })
    };

    // Wait until the agent answers pings, so its job subscription is live too
    let mut pongs = bus.subscribe(topics::PONG).await.unwrap();
    loop {
        bus.publish(topics::PING, Vec::new()).await.unwrap();
        if let Ok(Some(_)) = timeout(Duration::from_millis(50), pongs.recv()).await {
            break;
        }
    }

    Running {
        bus,
        shutdown,
        task,
        success,
        error,
        _dir: dir,
    }
}

impl Running {
    /// Dispatch `script` as a fresh deploy and return the ack
    async fn dispatch(&self, script: &str) -> Vec<u8> {
        let deploy = format!("d{}", NEXT_DEPLOY.fetch_add(1, Ordering::Relaxed));
        let envelope = Envelope::new("web1", "base", script, deploy);
        self.bus
            .request(&topics::playbook("web1"), envelope.encode(), WAIT)
            .await
            .unwrap()
            .payload
    }
}

#[tokio::test]
async fn test_pong_carries_host_name() {
    let agent = start_agent().await;
    let mut pongs = agent.bus.subscribe(topics::PONG).await.unwrap();

    agent.bus.publish(topics::PING, Vec::new()).await.unwrap();
    let pong = timeout(WAIT, pongs.recv()).await.unwrap().unwrap();

    assert_eq!(pong.text(), "web1");
}

#[tokio::test]
async fn test_ack_precedes_completion() {
    let mut agent = start_agent().await;
    let script = "sleep 0.5; echo done";

    let ack = agent.dispatch(script).await;
    assert_eq!(ack, checksum(script.as_bytes()).into_bytes());
    assert!(agent.success.try_recv().is_none());

    let outcome = timeout(WAIT, agent.success.recv()).await.unwrap().unwrap();
    assert_eq!(outcome.text().trim(), "done");
    assert!(agent.error.try_recv().is_none());
}

#[tokio::test]
async fn test_failure_reports_only_on_error_topic() {
    let mut agent = start_agent().await;

    agent.dispatch("echo boom >&2; exit 3").await;
    let outcome = timeout(WAIT, agent.error.recv()).await.unwrap().unwrap();

    assert!(outcome.text().contains("boom"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(agent.success.try_recv().is_none());
}

#[tokio::test]
async fn test_malformed_dispatch_gets_empty_reply() {
    let mut agent = start_agent().await;

    let reply = agent
        .bus
        .request(&topics::playbook("web1"), b"not json".to_vec(), WAIT)
        .await
        .unwrap();
    assert!(reply.payload.is_empty());

    // Still serving afterwards
    let ack = agent.dispatch("echo again").await;
    assert!(!ack.is_empty());
    let outcome = timeout(WAIT, agent.success.recv()).await.unwrap().unwrap();
    assert_eq!(outcome.text().trim(), "again");
}

#[tokio::test]
async fn test_jobs_run_one_at_a_time() {
    let mut agent = start_agent().await;

    agent.dispatch("sleep 0.3; echo first").await;
    // The second ack is only sent once the first job has reported
    agent.dispatch("echo second").await;

    let first = agent.success.try_recv().unwrap();
    assert_eq!(first.text().trim(), "first");

    let second = timeout(WAIT, agent.success.recv()).await.unwrap().unwrap();
    assert_eq!(second.text().trim(), "second");
}

#[tokio::test]
async fn test_retried_deploy_runs_once() {
    let mut agent = start_agent().await;
    let marks = tempfile::tempdir().unwrap();
    let log = marks.path().join("runs");

    agent.dispatch("sleep 1; echo busy").await;

    // Both attempts queue behind the busy job and time out at the dispatcher
    let script = format!("echo run >> {}", log.display());
    let envelope = Envelope::new("web1", "base", script.clone(), "retried");
    for _ in 0..2 {
        let attempt = agent
            .bus
            .request(
                &topics::playbook("web1"),
                envelope.encode(),
                Duration::from_millis(100),
            )
            .await;
        assert!(attempt.is_err());
    }

    let busy = timeout(WAIT, agent.success.recv()).await.unwrap().unwrap();
    assert_eq!(busy.text().trim(), "busy");
    timeout(WAIT, agent.success.recv()).await.unwrap().unwrap();

    // A later retry is still acked with the checksum
    let ack = agent
        .bus
        .request(&topics::playbook("web1"), envelope.encode(), WAIT)
        .await
        .unwrap();
    assert_eq!(ack.payload, checksum(script.as_bytes()).into_bytes());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(agent.success.try_recv().is_none());
    assert!(agent.error.try_recv().is_none());

    let runs = std::fs::read_to_string(&log).unwrap();
    assert_eq!(runs.lines().count(), 1);
}

#[tokio::test]
async fn test_shutdown_cancels_running_job() {
    let mut agent = start_agent().await;

    agent.dispatch("sleep 30").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    agent.shutdown.cancel();

    let outcome = timeout(WAIT, agent.error.recv()).await.unwrap();
    assert!(outcome.is_some());
    assert!(agent.success.try_recv().is_none());

    timeout(WAIT, agent.task).await.unwrap().unwrap().unwrap();
}
