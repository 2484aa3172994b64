//! qToggle Server
//!
//! Loads the configuration, opens persistence, loads ports and runs the
//! update and save loops until interrupted.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use qtoggle::drivers::DriverRegistry;
use qtoggle::service::ServiceManager;
use qtoggle::{Config, Core};

/// qToggle control node
#[derive(Parser, Debug)]
#[command(name = "qtoggle")]
#[command(about = "qToggle control node", long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "qtoggleserver.toml")]
    config: PathBuf,

    /// Log filter used when RUST_LOG is not set (overrides the config file)
    #[arg(long)]
    log_level: Option<String>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(Some(args.config.as_path()))
        .with_context(|| format!("Failed to load configuration from {}", args.config.display()))?;

    if args.print_config {
        print!("{}", config.to_toml().context("Failed to render configuration")?);
        return Ok(());
    }

    let level = args.log_level.clone().unwrap_or_else(|| config.log.level.clone());
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("qtoggle={}", level))),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting qToggle v{}", env!("CARGO_PKG_VERSION"));

    let persist = qtoggle_persist::open(&config.persist).context("Failed to open persistence")?;
    persist
        .init()
        .await
        .with_context(|| format!("Failed to initialize {} persistence", persist.name()))?;

    let manager = ServiceManager::new();
    let core = Core::new(
        config.core.clone(),
        persist.clone(),
        DriverRegistry::new(),
        manager.event_publisher(),
    );

    let failed = core.load(&config.ports, &config.port_mappings).await;
    if !failed.is_empty() {
        warn!("{} port(s) could not be loaded", failed.len());
    }

    core.start_services(&manager)
        .context("Failed to start services")?;
    for (id, state) in manager.list() {
        info!("  - {} ({})", id, state);
    }

    shutdown_signal().await;

    info!("Shutting down services...");
    if let Err(e) = manager.shutdown_all().await {
        warn!("Some services did not shut down cleanly: {}", e);
    }
    core.cleanup().await;
    if let Err(e) = persist.cleanup().await {
        error!("Persistence cleanup failed: {}", e);
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }
}
