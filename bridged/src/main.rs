use anyhow::{Context, Result};
use clap::Parser;
use std::io;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bridge_store::{roster, HeartbeatStore, StorePaths};
use bridged::config::BridgeConfig;
use bridged::daemon::BridgeDaemon;

#[derive(Parser, Debug)]
#[command(
    name = "bridged",
    version,
    about = "Worker bridge daemon: polls a file-resident task queue and drives a code-generation CLI"
)]
struct Cli {
    /// Path to the worker bridge config (JSON)
    #[arg(long)]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(io::stderr)
        .init();

    let config = BridgeConfig::load(&cli.config)
        .with_context(|| format!("failed to load bridge config from {}", cli.config.display()))?;
    info!(
        team = %config.team_name,
        worker = %config.worker_name,
        executor = config.executor.as_str(),
        root = %config.state_root().display(),
        "bridged starting"
    );

    spawn_signal_handler(config.clone());

    let mut daemon = BridgeDaemon::new(config);
    daemon.run().await
}

/// On SIGINT/SIGTERM, scrub this worker's presence markers before dying.
/// A lead-driven shutdown goes through the signal file instead; this path
/// only covers the daemon being killed out-of-band.
fn spawn_signal_handler(config: BridgeConfig) {
    tokio::spawn(async move {
        if wait_for_termination().await.is_err() {
            return;
        }
        warn!("termination signal received, cleaning up");
        HeartbeatStore::new(&config.working_directory)
            .delete(&config.team_name, &config.worker_name);
        let paths = StorePaths::new(config.state_root());
        if let Err(err) = roster::unregister_worker(
            &paths,
            &config.working_directory,
            &config.team_name,
            &config.worker_name,
        ) {
            warn!(%err, "roster unregister failed");
        }
        std::process::exit(0);
    });
}

async fn wait_for_termination() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map_err(Into::into),
        _ = term.recv() => Ok(()),
    }
}
