//! HiveSync Worker Daemon

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hivesync_core::WorkerId;
use hivesync_engine::backoff::Backoff;
use hivesync_engine::config::StoreArgs;
use hivesync_engine::{Coordinator, Reconciler};

mod config;
mod executor;
mod json_output;
mod session;

use config::Config;
use executor::SimulatedExecutor;
use session::WorkerSession;

/// HiveSync worker daemon.
#[derive(Parser, Debug)]
#[command(name = "hivesync-worker", about = "HiveSync worker daemon")]
struct Args {
    #[command(flatten)]
    store: StoreArgs,

    /// Worker ID (generated when omitted)
    #[arg(long)]
    worker_id: Option<String>,

    /// Capability tag (repeatable)
    #[arg(long = "capability", short = 'C')]
    capabilities: Vec<String>,

    /// Maximum tasks run at once
    #[arg(long, default_value = "1")]
    max_concurrent_tasks: u32,

    /// Heartbeat interval in seconds
    #[arg(long, default_value = "15")]
    heartbeat_interval: u64,

    /// Work polling interval in milliseconds
    #[arg(long, default_value = "1000")]
    poll_interval_ms: u64,

    /// Also run a reconciler in this process
    #[arg(long)]
    reconcile: bool,

    /// Simulated steps per task
    #[arg(long, default_value = "4")]
    steps: u32,

    /// Simulated step duration in milliseconds
    #[arg(long, default_value = "500")]
    step_ms: u64,

    /// Probability in [0, 1] that a simulated task fails
    #[arg(long, default_value = "0.0")]
    failure_rate: f64,

    /// Output events as JSON lines on stdout
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Logs go to stderr so JSON output stays clean.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("hivesync=info".parse()?))
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let engine_config = args.store.load()?;
    let config = Arc::new(Config {
        worker_id: args
            .worker_id
            .map(WorkerId::new)
            .unwrap_or_else(WorkerId::generate),
        capabilities: args.capabilities.iter().map(String::as_str).collect(),
        max_concurrent_tasks: args.max_concurrent_tasks.max(1),
        heartbeat_interval_secs: args.heartbeat_interval,
        poll_interval_ms: args.poll_interval_ms,
        reconcile: args.reconcile,
        json_output: args.json,
        ..Default::default()
    });

    info!(
        worker_id = %config.worker_id,
        max_concurrent_tasks = config.max_concurrent_tasks,
        reconcile = config.reconcile,
        "Starting HiveSync worker"
    );

    let coordinator = Arc::new(Coordinator::builder().config(engine_config).build()?);
    let executor = Arc::new(SimulatedExecutor::new(
        args.steps,
        Duration::from_millis(args.step_ms),
        args.failure_rate,
    ));
    let session = WorkerSession::new(coordinator.clone(), config.clone(), executor);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, shutting down");
            }
            cancel.cancel();
        }
    });

    let reconciler = config
        .reconcile
        .then(|| tokio::spawn(Reconciler::new(coordinator).run(cancel.clone())));

    // Re-join loop
    let mut backoff = Backoff::new(
        Duration::from_secs(config.reconnect_delay_secs),
        Duration::from_secs(config.reconnect_delay_secs * 12),
    );
    loop {
        match session.run(cancel.clone()).await {
            Ok(()) => break,
            Err(e) => error!(error = %e, "Worker session failed"),
        }

        let delay = backoff.next_delay();
        info!(delay_ms = delay.as_millis() as u64, "Rejoining after delay");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    if let Some(handle) = reconciler {
        if let Err(e) = handle.await {
            error!(error = %e, "Reconciler task panicked");
        }
    }

    info!("HiveSync worker stopped");
    Ok(())
}
