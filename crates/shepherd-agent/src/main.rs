//! shepherd agent
//!
//! Runs on every managed host: answers discovery and executes dispatched
//! playbooks.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::Result;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use shepherd_agent::{Agent, AgentConfig};
use shepherd_api::PlainText;
use shepherd_bus::MqttBus;

#[derive(Parser)]
#[command(name = "shepherd-agent")]
#[command(about = "Playbook executor for shepherd-managed hosts", long_about = None)]
struct Cli {
    /// Config file (defaults to the standard search path)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host identity, overriding config and OS hostname
    #[arg(long)]
    host: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AgentConfig::load(path)?,
        None => AgentConfig::load_default()?,
    };
    if cli.host.is_some() {
        config.host = cli.host;
    }

    init_tracing(&config.log_level, &config.log_format);

    let host = config.host_name();
    let bus = Arc::new(MqttBus::connect(&config.bus));
    let agent = Agent::new(host, bus, Arc::new(PlainText), &config.job);

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    info!(host = %agent.host(), broker = %config.bus.host, "shepherd agent starting");
    agent.run(shutdown).await?;

    Ok(())
}

fn init_tracing(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
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
