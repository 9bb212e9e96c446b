//! Edge agent — reconciles local DNS-SD discovery with a global DNS zone.
//!
//! # Usage
//!
//! ```bash
//! bridge-edge                          # run with the default config/db paths
//! bridge-edge --config /etc/bridge.xml # use a specific config file
//! ```
//!
//! # Architecture
//!
//! 1. mDNS discovery (`LocalDiscoveryAdapter`, background blocking threads
//!    bridged to async channels via `mdns-sd`)
//! 2. The `Reconciler` event loop, the sole writer of the local store and
//!    the DNS zone
//! 3. A signal handler that triggers the teardown-and-exit sequence

mod discovery;
mod dns_updater;
mod policy;
mod reconciler;

use anyhow::{Context, Result};
use bridge_core::config::Config;
use bridge_core::db::Database;
use bridge_core::types::IpVersion;
use clap::Parser;
use discovery::LocalDiscoveryAdapter;
use dns_updater::DnsUpdater;
use reconciler::Reconciler;
use std::path::PathBuf;
use tracing::{error, info};

/// Edge agent — bridges mDNS/DNS-SD service discovery to a global DNS zone.
#[derive(Parser, Debug)]
#[command(name = "bridge-edge", about = "DNS-SD to global-DNS bridge (edge agent)")]
struct Cli {
    /// Path to the XML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the SQLite database file.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Network interface to restrict mDNS browsing to (default: the
    /// default-route interface).
    #[arg(long)]
    interface: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => Config::config_file_path().context("could not determine config directory")?,
    };
    let config = Config::load_from(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    init_logging(config.log_level.as_tracing_level());
    info!(path = %config_path.display(), "loaded config");

    let db_path = match &cli.db {
        Some(path) => path.clone(),
        None => Config::default_db_path().context("could not determine data directory")?,
    };
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Database::open(&db_path).context("failed to open database")?;
    info!(path = %db_path.display(), "database opened");

    let updater = DnsUpdater::new(config.domain.clone()).map_err(|e| anyhow::anyhow!("{e}"))?;

    let interface = cli
        .interface
        .clone()
        .or_else(default_interface_name)
        .unwrap_or_default();
    let proto = IpVersion::V4;

    let (adapter, discovery_rx) = LocalDiscoveryAdapter::start(interface.clone(), proto)
        .context("failed to start mDNS discovery")?;
    info!(interface, "mDNS discovery started");

    let mut reconciler = Reconciler::new(db, updater, config);
    reconciler.startup().await.map_err(|e| anyhow::anyhow!("{e}"))?;

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    spawn_shutdown_signals(shutdown_tx);

    info!("edge agent running, press Ctrl+C to stop");
    tokio::select! {
        _ = reconciler.run(discovery_rx) => {}
        _ = shutdown_rx.recv() => {
            info!("shutting down");
        }
    }

    reconciler.shutdown().await;
    adapter.shutdown();
    info!("edge agent stopped");
    Ok(())
}

fn default_interface_name() -> Option<String> {
    netdev::get_default_interface().ok().map(|i| i.name)
}

/// Spawns listeners for every termination signal available on this
/// platform; each one sends on `tx` to trigger the shutdown-and-exit
/// sequence. Only the subset a platform actually has is installed.
fn spawn_shutdown_signals(tx: tokio::sync::mpsc::Sender<()>) {
    let ctrl_c_tx = tx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received SIGINT, shutting down");
                let _ = ctrl_c_tx.send(()).await;
            }
            Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        for (kind, name) in [
            (SignalKind::terminate(), "SIGTERM"),
            (SignalKind::quit(), "SIGQUIT"),
            (SignalKind::hangup(), "SIGHUP"),
            (SignalKind::from_raw(6), "SIGABRT"),
        ] {
            let tx = tx.clone();
            tokio::spawn(async move {
                match signal(kind) {
                    Ok(mut stream) => {
                        stream.recv().await;
                        info!("received {name}, shutting down");
                        let _ = tx.send(()).await;
                    }
                    Err(e) => error!(error = %e, signal = name, "failed to install signal handler"),
                }
            });
        }
    }
}

/// Initializes the tracing logging infrastructure: stderr and a persistent
/// log file under the data directory. `BRIDGE_LOG` overrides the configured
/// `<config log level="...">` when set.
fn init_logging(default_level: tracing::Level) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_env("BRIDGE_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    let file_layer = Config::data_dir()
        .and_then(|dir| {
            std::fs::create_dir_all(&dir).ok()?;
            let log_path = dir.join("edge.log");
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
                .ok()
        })
        .map(|file| {
            fmt::layer()
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
        });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
}
