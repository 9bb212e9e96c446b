//! Central controller — walks the published DNS-SD zone and compiles
//! per-router iptables/ip6tables FORWARD scripts.
//!
//! # Usage
//!
//! ```bash
//! bridge-compiler                          # run the reconciliation loop forever
//! bridge-compiler --once                   # run a single tick and exit
//! bridge-compiler --config /etc/bridge.xml
//! ```

mod compiler;
mod tick;
mod zone_reader;

use bridge_core::config::Config;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tick::TickState;
use tracing::{error, info};

const DEFAULT_UPDATE_RATE_SECS: u64 = 60;

/// Central controller — compiles the zone into per-router filter scripts.
#[derive(Parser, Debug)]
#[command(name = "bridge-compiler", about = "DNS-SD to global-DNS bridge (central controller)")]
struct Cli {
    /// Path to the XML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory the per-router iptables_<router>.sh scripts are written to.
    #[arg(long, default_value = "/etc/bridge/filters")]
    output_dir: PathBuf,

    /// Run a single tick and exit, instead of looping forever.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => match Config::config_file_path() {
            Ok(path) => path,
            Err(e) => {
                eprintln!("could not determine config directory: {e}");
                return ExitCode::from(1);
            }
        },
    };

    let config = match Config::load_from(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load config from {}: {e}", config_path.display());
            return ExitCode::from(1);
        }
    };

    init_logging(config.log_level.as_tracing_level());
    info!(path = %config_path.display(), "loaded config");

    let rate = Duration::from_secs(config.update_rate_secs.unwrap_or(DEFAULT_UPDATE_RATE_SECS));
    let mut state = TickState::new();

    if cli.once {
        tick::run_tick(&mut state, &config, &config_path, &cli.output_dir).await;
        return ExitCode::SUCCESS;
    }

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    spawn_shutdown_signals(shutdown_tx);

    info!(rate_secs = rate.as_secs(), "central controller running");
    loop {
        let tick_started = tokio::time::Instant::now();
        tick::run_tick(&mut state, &config, &config_path, &cli.output_dir).await;
        let elapsed = tick_started.elapsed();
        if elapsed > rate * 2 {
            tracing::warn!(elapsed_secs = elapsed.as_secs(), "tick took longer than twice the configured rate");
        }

        tokio::select! {
            _ = tokio::time::sleep(rate.saturating_sub(elapsed.min(rate))) => {}
            _ = shutdown_rx.recv() => {
                info!("shutting down");
                break;
            }
        }
    }

    ExitCode::SUCCESS
}

/// Spawns listeners for every termination signal available on this
/// platform; each one sends on `tx` to trigger graceful shutdown. Only
/// the subset a platform actually has is installed.
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
            let log_path = dir.join("compiler.log");
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
