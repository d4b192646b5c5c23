//! nodemesh agent
//!
//! Runs the node store and a client manager for each built-in node type.
//! Clients are started and stopped as their nodes appear in or leave the
//! graph.

use anyhow::Result;
use nodemesh_agent::{Config, Server};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting nodemesh agent");
    info!(
        root_id = ?config.root_id,
        seed_file = ?config.seed_file,
        scan_interval_secs = config.scan_interval.as_secs(),
        shutdown_grace_secs = config.shutdown_grace.as_secs(),
        "Configuration loaded"
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut server = tokio::spawn(Server::new(config).run(shutdown_rx));

    // Wait for ctrl-c or an early server exit
    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
            server.await
        }
        joined = &mut server => joined,
    };

    match result {
        Ok(Ok(())) => {
            info!("Agent shutdown complete");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, "Agent failed");
            Err(e)
        }
        Err(e) => {
            error!(error = %e, "Server task panicked");
            Err(e.into())
        }
    }
}
