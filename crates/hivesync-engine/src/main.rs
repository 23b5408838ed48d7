//! HiveSync node: HTTP gateway plus a reconciler over a shared store.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hivesync_engine::config::StoreArgs;
use hivesync_engine::{http, Coordinator, Reconciler};

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:7400";

/// HiveSync coordination node.
#[derive(Parser, Debug)]
#[command(name = "hivesync-node", about = "HiveSync coordination node")]
struct Args {
    #[command(flatten)]
    store: StoreArgs,

    /// HTTP server address (overrides the config file)
    #[arg(long)]
    bind: Option<String>,

    /// Serve requests without running the reconciler
    #[arg(long)]
    no_reconciler: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("hivesync=info".parse()?))
        .with_target(true)
        .init();

    let config = args.store.load()?;
    let bind = args
        .bind
        .or_else(|| Some(config.http_bind_addr.clone()).filter(|a| !a.is_empty()))
        .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());

    let coordinator = Arc::new(Coordinator::builder().config(config).build()?);
    let cancel = CancellationToken::new();

    let reconciler = if args.no_reconciler {
        None
    } else {
        let reconciler = Reconciler::new(coordinator.clone());
        Some(tokio::spawn(reconciler.run(cancel.clone())))
    };

    let router = http::create_router(coordinator);
    let listener = TcpListener::bind(&bind).await?;
    info!(addr = %bind, "HTTP server listening");

    let shutdown = cancel.clone();
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
            _ = shutdown.cancelled() => {}
        }
    });

    if let Err(e) = server.await {
        error!(error = %e, "HTTP server error");
    }

    cancel.cancel();
    if let Some(handle) = reconciler {
        if let Err(e) = handle.await {
            error!(error = %e, "Reconciler task panicked");
        }
    }

    info!("HiveSync node stopped");
    Ok(())
}
