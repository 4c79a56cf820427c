//! Conductor worker agent entry point.
//!
//! Loads `Config` from `CONDUCTOR_AGENT_*` environment variables, wires the
//! adapters, recovers orphaned runs from a prior crash, then runs the
//! `Dispatcher`'s event loop until a shutdown signal or a fatal error ends
//! it. Exits `0` on a clean shutdown, `1` on a fatal error.

use std::sync::Arc;

use clap::Parser;
use conductor_agent::application::dispatcher::Dispatcher;
use conductor_agent::domain::error::AgentError;
use conductor_agent::domain::models::Config;
use conductor_agent::infrastructure::{config, logging, setup};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Grace period the shutdown signal handler waits for the drain it
/// triggers before forcing an exit; past this deadline, the forced exit
/// is logged.
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(30);

const CACHE_CLEANUP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(300);
const CACHE_MAX_AGE: std::time::Duration = std::time::Duration::from_secs(7 * 24 * 3600);

#[derive(Parser)]
#[command(name = "conductor-agent")]
#[command(about = "Conductor worker agent: maintains a session with the control plane and executes test runs", long_about = None)]
#[command(version)]
struct Cli {
    /// Run in the foreground (default); present for parity with process
    /// supervisors that always pass an explicit foreground flag.
    #[arg(long)]
    foreground: bool,
}

#[tokio::main]
async fn main() {
    let _cli = Cli::parse();

    let config = match config::load() {
        Ok(config) => Arc::new(config),
        Err(err) => {
            eprintln!("fatal: {err}");
            std::process::exit(1);
        }
    };

    logging::init(config.ambient.log_level, config.ambient.log_format);

    info!(agent_id = %config.identity.agent_id, max_parallel = config.max_parallel, "starting conductor agent");

    if let Err(err) = run(config).await {
        error!(error = %err, "agent exited with a fatal error");
        std::process::exit(1);
    }

    info!("agent shut down cleanly");
}

async fn run(config: Arc<Config>) -> Result<(), AgentError> {
    let dispatcher = setup::wire(config.clone()).await?;

    dispatcher.recover_orphans().await?;

    let shutdown = dispatcher.shutdown_token();
    tokio::spawn(heartbeat_task(dispatcher.clone(), config.timers.heartbeat_interval, shutdown.clone()));
    tokio::spawn(cache_cleanup_task(dispatcher.clone(), shutdown.clone()));
    tokio::spawn(signal_task(shutdown.clone()));

    let run_fut = dispatcher.clone().run();
    tokio::pin!(run_fut);

    tokio::select! {
        result = &mut run_fut => result,
        () = shutdown.cancelled() => {
            match tokio::time::timeout(SHUTDOWN_GRACE, run_fut).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(grace_seconds = SHUTDOWN_GRACE.as_secs(), "shutdown grace period elapsed, forcing exit");
                    std::process::exit(0);
                }
            }
        }
    }
}

async fn heartbeat_task(dispatcher: Arc<Dispatcher>, interval: std::time::Duration, shutdown: CancellationToken) {
    dispatcher.run_heartbeat_loop(interval, shutdown).await;
}

async fn cache_cleanup_task(dispatcher: Arc<Dispatcher>, shutdown: CancellationToken) {
    dispatcher.run_cache_cleanup_loop(CACHE_CLEANUP_INTERVAL, CACHE_MAX_AGE, shutdown).await;
}

/// Cancels the shutdown token on SIGINT or SIGTERM. `run` owns the grace
/// window for the drain this triggers.
async fn signal_task(shutdown: CancellationToken) {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler");
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to install SIGINT handler");
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }

    shutdown.cancel();
}
