//! envtunnel CLI - Open and share platform environment tunnels
//!
//! Every invocation coordinates with other envtunnel processes through the
//! shared lock store, so running it from several shells or services never
//! opens the same tunnel twice.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use envtunnel_core::{
    AssumeHealthy, CommandTunnelCli, HealthProbe, LockStore, ManagerConfig, MemoryLockStore,
    TunnelManager, TunnelRecord,
};
use envtunnel_redis::{RedisLockStore, RedisPingProbe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

/// envtunnel - Shared, self-healing tunnels to remote environments
#[derive(Parser, Debug)]
#[command(name = "envtunnel")]
#[command(about = "Open, share and reap tunnels to remote platform environments")]
#[command(version)]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Enable verbose logging (same as --log-level debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// YAML configuration file
    #[arg(long, global = true, env = "ENVTUNNEL_CONFIG")]
    config: Option<PathBuf>,

    /// Redis URL of the shared lock store (e.g. redis://127.0.0.1:6379/0)
    #[arg(long, global = true, env = "ENVTUNNEL_REDIS_URL")]
    redis_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct Target {
    /// Project identifier
    #[arg(short, long, env = "ENVTUNNEL_PROJECT")]
    project: String,

    /// Environment name
    #[arg(short, long, env = "ENVTUNNEL_ENVIRONMENT", default_value = "main")]
    environment: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open (or reuse) the tunnel and print every service endpoint as JSON
    Open {
        #[command(flatten)]
        target: Target,

        /// Keep running until Ctrl+C so the idle timer can reap the tunnel
        #[arg(long)]
        hold: bool,
    },

    /// Print the endpoints of one service as JSON
    Service {
        #[command(flatten)]
        target: Target,

        /// Service name (e.g. database, cache, search)
        service: String,

        /// Keep running until Ctrl+C so the idle timer can reap the tunnel
        #[arg(long)]
        hold: bool,
    },

    /// Close the tunnel unless another process is working on it
    Close {
        #[command(flatten)]
        target: Target,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        "debug"
    } else {
        cli.log_level.as_str()
    };
    init_logging(level)?;

    let config = load_config(cli.config.as_deref())?;
    let manager = build_manager(config, cli.redis_url.as_deref()).await?;

    match cli.command {
        Commands::Open { target, hold } => {
            let record = manager
                .open_tunnel(&target.project, &target.environment)
                .await
                .with_context(|| format!("Failed to open tunnel for {}", describe(&target)))?;
            print_record(&record)?;
            if hold {
                hold_until_interrupted(&manager).await?;
            }
        }
        Commands::Service {
            target,
            service,
            hold,
        } => {
            let record = manager
                .get_service_tunnel_info(&target.project, &target.environment, &service)
                .await
                .with_context(|| {
                    format!("Failed to resolve {} for {}", service, describe(&target))
                })?;
            print_record(&record)?;
            if hold {
                hold_until_interrupted(&manager).await?;
            }
        }
        Commands::Close { target } => {
            manager
                .close_tunnel(&target.project, &target.environment)
                .await
                .with_context(|| format!("Failed to close tunnel for {}", describe(&target)))?;
            info!("Tunnel for {} closed", describe(&target));
        }
    }

    manager.shutdown();
    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    // Logs go to stderr; stdout carries the JSON records
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<ManagerConfig> {
    match path {
        Some(path) if path.exists() => {
            info!("Loading configuration from {}", path.display());
            ManagerConfig::from_yaml_file(path)
                .with_context(|| format!("Invalid configuration in {}", path.display()))
        }
        Some(path) => {
            warn!(
                "Configuration file {} not found, using defaults",
                path.display()
            );
            Ok(ManagerConfig::default())
        }
        None => Ok(ManagerConfig::default()),
    }
}

async fn build_manager(config: ManagerConfig, redis_url: Option<&str>) -> Result<TunnelManager> {
    let store: Arc<dyn LockStore> = match redis_url {
        Some(url) => Arc::new(
            RedisLockStore::connect(url)
                .await
                .context("Failed to connect to the lock store")?,
        ),
        None => {
            warn!("⚠️  No --redis-url given; tunnels are only coordinated within this process");
            Arc::new(MemoryLockStore::new())
        }
    };

    let probe: Arc<dyn HealthProbe> = match &config.probe.service {
        Some(service) => Arc::new(RedisPingProbe::new(service.clone(), config.probe.timeout)),
        None => Arc::new(AssumeHealthy),
    };

    let cli = Arc::new(CommandTunnelCli::new(config.cli.clone()));

    TunnelManager::new(config, cli, store, probe).context("Failed to create tunnel manager")
}

fn print_record(record: &TunnelRecord) -> Result<()> {
    let json = serde_json::to_string_pretty(record).context("Failed to serialize tunnel record")?;
    println!("{}", json);
    Ok(())
}

async fn hold_until_interrupted(manager: &TunnelManager) -> Result<()> {
    info!(
        "Holding tunnel open; it is closed after {:?} without lookups. Press Ctrl+C to exit",
        manager.config().idle_timeout
    );
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down...");
    Ok(())
}

fn describe(target: &Target) -> String {
    format!("{}/{}", target.project, target.environment)
}
