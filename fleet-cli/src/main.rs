//! fleetctl - runs a cluster state controller against a node directory

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use fleet_cli::config::{CliConfig, ConfigManager};
use fleet_cli::listener::LoggingListener;
use fleet_core::listener::ClusterStateListener;
use fleet_core::resolver::{build_directory, directory_delta};
use fleet_core::{ControllerHandle, FleetController, UdpNodeRpc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Cluster state controller
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log filter; overrides `log.level` and is itself overridden by RUST_LOG
    #[arg(short, long)]
    log_level: Option<String>,

    /// Configuration file layered over the built-in defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller until interrupted
    Run,

    /// Validate the configuration and print the effective settings
    CheckConfig,

    /// Read or change a single configuration key
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective value of a dotted key
    Get { key: String },

    /// Persist an override into the file given with --config
    Set { key: String, value: String },
}

fn init_logging(level: &str, ansi: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log filter '{level}'"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(ansi)
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

/// Announces every node the directory lists.
async fn seed_directory(config: &CliConfig, controller: &ControllerHandle) -> Result<usize> {
    let directory = build_directory(&config.controller.directory)
        .context("failed to build node directory")?;
    let discovered = directory.list().await.context("failed to list nodes")?;
    let events = directory_delta(&BTreeMap::new(), &discovered);
    let count = events.len();
    for event in events {
        controller.resolver_event(event).await?;
    }
    Ok(count)
}

async fn run(config: CliConfig) -> Result<()> {
    let (rpc, transport) = UdpNodeRpc::start(&config.controller.transport)
        .await
        .context("failed to start node transport")?;
    info!(addr = %rpc.local_addr()?, "node transport bound");

    let listeners: Vec<Arc<dyn ClusterStateListener>> = vec![Arc::new(LoggingListener)];
    let controller = FleetController::spawn(config.controller.clone(), rpc, listeners)
        .context("failed to start controller")?;

    match seed_directory(&config, &controller).await {
        Ok(count) => info!(nodes = count, "directory seeded"),
        Err(err) => {
            controller.request_shutdown();
            transport.request_shutdown();
            transport.wait().await;
            return Err(err);
        }
    }

    let mut status = controller.status_watch();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                info!("interrupt received, stopping controller");
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    warn!("control loop exited on its own");
                    break;
                }
            }
        }
    }

    controller.request_shutdown();
    let outcome = controller.wait().await;
    transport.request_shutdown();
    transport.wait().await;
    outcome.context("controller terminated with an error")
}

fn load(path: Option<PathBuf>) -> Result<ConfigManager> {
    match path {
        Some(path) => ConfigManager::load_with_path(path),
        None => ConfigManager::load_defaults(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut manager = load(cli.config)?;

    match cli.command {
        Commands::Run => {
            let config = manager.into_config();
            let level = cli.log_level.unwrap_or_else(|| config.log.level.clone());
            init_logging(&level, config.log.ansi)?;
            run(config).await
        }
        Commands::CheckConfig => {
            if let Some(path) = manager.path() {
                println!("# layered over defaults from {}", path.display());
            }
            print!("{}", manager.config().to_toml()?);
            Ok(())
        }
        Commands::Config { action } => match action {
            ConfigAction::Get { key } => {
                let value = manager
                    .get(&key)
                    .ok_or_else(|| anyhow!("unknown configuration key: {key}"))?;
                println!("{value}");
                Ok(())
            }
            ConfigAction::Set { key, value } => {
                manager.set(&key, &value)?;
                manager.save()?;
                println!("{key} = {}", manager.get(&key).unwrap_or(value));
                Ok(())
            }
        },
    }
}
