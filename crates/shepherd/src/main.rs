//! shepherd control plane
//!
//! Discovers agents, dispatches playbooks to hosts and groups, and manages
//! the records behind them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use eyre::{WrapErr, eyre};
use kameo::actor::{ActorRef, Spawn};
use serde::Serialize;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use shepherd_api::PlainText;
use shepherd_bus::{MessageBus, MqttBus};
use shepherd_core::{
    ControlReply, ControlRequest, ControlServer, CoreError, Db, DeployGroup, DeployHost,
    Discovery, EventStream, FleetActor, FleetActorArgs, Inventory, KeyRing, StoreError,
    Subscribe, forward, spawn_deploy_writer, wait_finished,
};

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "shepherd")]
#[command(about = "Pull-free playbook dispatch for a fleet of agents", long_about = None)]
struct Cli {
    /// Config file (defaults to the standard search path)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run discovery and record deploy events until interrupted
    Serve,
    /// Deploy a playbook
    Deploy {
        #[command(subcommand)]
        target: DeployTarget,
    },
    /// List known hosts
    #[command(name = "hosts")]
    Hosts,
    /// Manage groups
    Groups {
        #[command(subcommand)]
        action: GroupAction,
    },
    /// Manage API keys
    Keys {
        #[command(subcommand)]
        action: KeyAction,
    },
}

#[derive(Subcommand)]
enum DeployTarget {
    /// Deploy to one host
    Host {
        host: String,
        playbook: String,
        /// Return once the agent acknowledged instead of waiting for the outcome
        #[arg(long)]
        ack_only: bool,
    },
    /// Deploy a group's playbook to all its hosts
    Group {
        group: String,
        /// Return after dispatch instead of waiting for every outcome
        #[arg(long)]
        no_wait: bool,
    },
}

#[derive(Subcommand)]
enum GroupAction {
    /// List groups
    List,
    /// Add a host to a group
    AddHost { group: String, host: String },
    /// Remove a host from a group
    RemoveHost { group: String, host: String },
    /// Assign a playbook to a group
    Assign { group: String, playbook: String },
}

#[derive(Subcommand)]
enum KeyAction {
    /// Create a key
    Create { name: String },
    /// List keys
    List,
    /// Issue a new token for a key
    Rotate { name: String },
    /// Delete a key
    Delete { name: String },
}

/// Running fleet with its bus, discovery and event writer
struct ControlPlane {
    bus: Arc<dyn MessageBus>,
    fleet: ActorRef<FleetActor>,
    discovery: Discovery,
    writer: JoinHandle<()>,
}

impl ControlPlane {
    async fn start(config: &Config, db: Db) -> Result<Self> {
        let bus: Arc<dyn MessageBus> = Arc::new(MqttBus::connect(&config.bus));

        let (events, writer_rx) = broadcast::channel(1024);
        let writer = spawn_deploy_writer(Arc::clone(&db.deploys), writer_rx);

        let fleet = FleetActor::spawn(FleetActorArgs {
            db,
            bus: Arc::clone(&bus),
            cipher: Arc::new(PlainText),
            policy: config.deploy_policy(),
            events,
        });
        let discovery = Discovery::new(Arc::clone(&bus), fleet.clone(), config.discovery());

        Ok(Self {
            bus,
            fleet,
            discovery,
            writer,
        })
    }

    /// Refresh the registry before targeting hosts
    async fn discover(&self) -> Result<()> {
        let report = self.discovery.cycle().await?;
        info!(
            seen = report.seen.len(),
            created = report.created.len(),
            "discovery finished"
        );
        Ok(())
    }

    async fn stop(self) {
        if let Err(e) = self.fleet.stop_gracefully().await {
            warn!(error = %e, "fleet did not stop cleanly");
        }
        // The writer ends once the fleet and its deploys drop their senders
        if tokio::time::timeout(Duration::from_secs(1), self.writer)
            .await
            .is_err()
        {
            warn!("deploy writer still busy at exit");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    init_tracing(&config.log_level, &config.log_format);

    match cli.command {
        Commands::Serve => serve(&config).await,
        Commands::Deploy { target } => deploy(&config, target).await,
        Commands::Hosts => {
            let db = view_store(&config).await?;
            let mut hosts = db.hosts.find_all().await?;
            hosts.sort_by(|a, b| a.name.cmp(&b.name));
            print_json(&hosts)
        }
        Commands::Groups { action } => groups(&config, action).await,
        Commands::Keys { action } => keys(&config, action).await,
    }
}

/// Take ownership of the store and load the configured records
async fn open_store(config: &Config) -> Result<Db, StoreError> {
    match &config.store.dir {
        Some(dir) => Db::open_dir(dir).await,
        None => {
            warn!("no store directory configured, records are kept in memory only");
            Ok(Db::in_memory())
        }
    }
}

/// Read-only copy of the store, usable while another process owns it
async fn view_store(config: &Config) -> Result<Db> {
    let db = match &config.store.dir {
        Some(dir) => Db::snapshot_dir(dir).await?,
        None => Db::in_memory(),
    };
    seed(config, &db).await?;
    Ok(db)
}

/// Store for commands that change records
async fn owned_store(config: &Config) -> Result<Db> {
    let db = open_store(config)
        .await
        .wrap_err("changing records needs the store; stop `shepherd serve` first")?;
    seed(config, &db).await?;
    Ok(db)
}

async fn seed(config: &Config, db: &Db) -> Result<()> {
    Inventory::new(db.clone())
        .seed(&config.playbooks()?, &config.group)
        .await?;
    Ok(())
}

async fn serve(config: &Config) -> Result<()> {
    let db = owned_store(config).await?;
    let plane = ControlPlane::start(config, db).await?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let control = ControlServer::bind(Arc::clone(&plane.bus), plane.fleet.clone()).await?;
    let control = tokio::spawn(control.run(shutdown.clone()));

    info!(broker = %config.bus.host, "shepherd serving");
    plane.discovery.run(shutdown).await;
    if let Err(e) = control.await {
        warn!(error = %e, "control task failed");
    }
    plane.stop().await;
    Ok(())
}

async fn deploy(config: &Config, target: DeployTarget) -> Result<()> {
    let db = match open_store(config).await {
        Ok(db) => db,
        Err(StoreError::Locked(dir)) => {
            info!(store = %dir, "store is owned by a running control plane, forwarding");
            return deploy_forwarded(config, target).await;
        }
        Err(e) => return Err(e.into()),
    };
    seed(config, &db).await?;

    let plane = ControlPlane::start(config, db).await?;
    plane.discover().await?;

    let result = match target {
        DeployTarget::Host {
            host,
            playbook,
            ack_only,
        } => deploy_host(&plane, host, playbook, ack_only).await,
        DeployTarget::Group { group, no_wait } => deploy_group(&plane, group, no_wait).await,
    };

    plane.stop().await;
    result
}

/// Hand the deploy to the process owning the store; it tracks the outcome
async fn deploy_forwarded(config: &Config, target: DeployTarget) -> Result<()> {
    let mut bus_config = config.bus.clone();
    bus_config.client_id = format!("{}-cli-{}", bus_config.client_id, std::process::id());
    let bus = MqttBus::connect(&bus_config);

    let request = match target {
        DeployTarget::Host { host, playbook, .. } => ControlRequest::Host { host, playbook },
        DeployTarget::Group { group, .. } => ControlRequest::Group { group },
    };
    let policy = config.deploy_policy();
    let reply = forward(&bus, &request, policy.abandon_after + policy.attempt_timeout).await?;
    print_json(&reply)?;

    match reply {
        ControlReply::Acked { deploy } => {
            info!(deploy = %deploy.id, "acked; the serving control plane records the outcome");
            Ok(())
        }
        ControlReply::Dispatched { report } if report.accepted() => Ok(()),
        ControlReply::Dispatched { .. } => Err(eyre!("no host in the group could be dispatched")),
        ControlReply::Failed { error } => Err(eyre!(error)),
    }
}

async fn deploy_host(
    plane: &ControlPlane,
    host: String,
    playbook: String,
    ack_only: bool,
) -> Result<()> {
    let handle = plane
        .fleet
        .ask(DeployHost { host, playbook })
        .await
        .map_err(CoreError::from)?;

    let acked = handle.wait_acked().await?;
    if ack_only {
        return print_json(&acked);
    }

    let done = handle.finished().await;
    print_json(&done)?;
    if done.state == shepherd_api::DeployState::Success {
        Ok(())
    } else {
        Err(eyre!("deploy {} ended in {}", done.id, done.state))
    }
}

async fn deploy_group(plane: &ControlPlane, group: String, no_wait: bool) -> Result<()> {
    let EventStream(mut events) = plane
        .fleet
        .ask(Subscribe)
        .await
        .map_err(|e| eyre!("{e}"))?;

    let report = plane
        .fleet
        .ask(DeployGroup {
            group: group.clone(),
        })
        .await
        .map_err(CoreError::from)?;
    print_json(&report)?;

    if !report.accepted() {
        return Err(eyre!("no host in group {group} could be dispatched"));
    }
    if no_wait {
        return Ok(());
    }

    let finished = wait_finished(&plane.fleet, &mut events, report.started.into_values()).await?;
    print_json(&finished)
}

async fn groups(config: &Config, action: GroupAction) -> Result<()> {
    if let GroupAction::List = action {
        let db = view_store(config).await?;
        let mut groups = db.groups.find_all().await?;
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        return print_json(&groups);
    }

    let inventory = Inventory::new(owned_store(config).await?);
    match action {
        GroupAction::List => Ok(()),
        GroupAction::AddHost { group, host } => {
            if !inventory.add_host(&group, &host).await? {
                println!("{host} is already in {group}");
            }
            Ok(())
        }
        GroupAction::RemoveHost { group, host } => {
            if !inventory.remove_host(&group, &host).await? {
                println!("{host} is not in {group}");
            }
            Ok(())
        }
        GroupAction::Assign { group, playbook } => {
            inventory.assign_playbook(&group, &playbook).await?;
            Ok(())
        }
    }
}

async fn keys(config: &Config, action: KeyAction) -> Result<()> {
    if let KeyAction::List = action {
        let db = view_store(config).await?;
        return print_json(&KeyRing::new(Arc::clone(&db.keys)).list().await?);
    }

    let db = owned_store(config).await?;
    let ring = KeyRing::new(Arc::clone(&db.keys));
    match action {
        KeyAction::List => Ok(()),
        KeyAction::Create { name } => print_json(&ring.create(&name).await?),
        KeyAction::Rotate { name } => print_json(&ring.rotate(&name).await?),
        KeyAction::Delete { name } => {
            if ring.delete(&name).await? {
                println!("deleted key {name}");
                Ok(())
            } else {
                Err(eyre!("key not found with name {name}"))
            }
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Cancel `shutdown` on SIGINT or SIGTERM
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let terminate = async {
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "cannot listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            () = terminate => info!("received SIGTERM"),
        }
        shutdown.cancel();
    });
}
