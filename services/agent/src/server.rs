//! Server orchestration.
//!
//! Startup order:
//! 1. Load the seed file and start the node store responder
//! 2. Wait for the store and resolve the root node
//! 3. Run the heartbeat client manager under the root
//!
//! Shutdown runs in reverse: managers first, then the store.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use nodemesh_bus::{Bus, MemoryBus};
use nodemesh_client::{BusNodeStore, Manager, ManagerOptions, NodeStore, StoreError};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::heartbeat::{Heartbeat, HeartbeatClient};
use crate::store::{MemoryStore, ROOT_ALIAS};

/// Delay between store lookups during startup.
const STARTUP_RETRY: Duration = Duration::from_millis(100);

pub struct Server {
    config: Config,
    bus: Arc<dyn Bus>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self::with_bus(config, Arc::new(MemoryBus::new()))
    }

    /// Uses an existing bus, so callers can talk to the nodes the server runs.
    pub fn with_bus(config: Config, bus: Arc<dyn Bus>) -> Self {
        Self { config, bus }
    }

    pub fn bus(&self) -> Arc<dyn Bus> {
        Arc::clone(&self.bus)
    }

    /// Runs until `shutdown` turns true or a manager fails.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let seed = match &self.config.seed_file {
            Some(path) => MemoryStore::load_seed(path)?,
            None => Vec::new(),
        };
        let store = Arc::new(MemoryStore::from_nodes(seed));
        let node_count = store.len().await;
        info!(nodes = node_count, "Node store loaded");

        let store_server = Arc::clone(&store)
            .serve(Arc::clone(&self.bus))
            .await
            .context("starting node store")?;

        let nodes: Arc<dyn NodeStore> = Arc::new(BusNodeStore::new(Arc::clone(&self.bus)));
        let root_id = match tokio::time::timeout(
            self.config.startup_timeout,
            resolve_root(nodes.as_ref(), self.config.root_id.as_deref()),
        )
        .await
        {
            Ok(Ok(root_id)) => root_id,
            Ok(Err(e)) => {
                store_server.shutdown().await;
                return Err(e);
            }
            Err(_) => {
                store_server.shutdown().await;
                anyhow::bail!(
                    "node store did not answer within {:?}",
                    self.config.startup_timeout
                );
            }
        };
        info!(root_id = %root_id, "Root node resolved");

        let manager = Manager::<Heartbeat>::new(
            Arc::clone(&self.bus),
            nodes,
            root_id,
            HeartbeatClient::new,
        )
        .with_options(ManagerOptions {
            scan_interval: self.config.scan_interval,
            shutdown_grace: self.config.shutdown_grace,
        });
        let heartbeats = manager.handle();
        let mut manager_task = tokio::spawn(manager.start());
        info!(node_type = heartbeats.node_type(), "Client manager started");

        let result = tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => {
                info!("Shutting down server");
                heartbeats.stop(None);
                join_manager(heartbeats.node_type(), manager_task.await)
            }
            joined = &mut manager_task => {
                warn!(node_type = heartbeats.node_type(), "Client manager exited unexpectedly");
                join_manager(heartbeats.node_type(), joined)
            }
        };

        store_server.shutdown().await;
        info!("Server stopped");
        result
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn join_manager(
    node_type: &str,
    joined: Result<Result<(), nodemesh_client::ManagerError>, tokio::task::JoinError>,
) -> Result<()> {
    match joined {
        Ok(Ok(())) => {
            info!(node_type, "Client manager stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(node_type, error = %e, "Client manager error");
            Err(e).context("client manager")
        }
        Err(e) => {
            error!(node_type, error = %e, "Client manager task panicked");
            Err(e).context("client manager task")
        }
    }
}

/// Returns the configured root, or asks the store for it.
///
/// Transient transport errors mean the store is not answering yet and are
/// retried; the caller bounds the wait.
async fn resolve_root(store: &dyn NodeStore, configured: Option<&str>) -> Result<String> {
    if let Some(id) = configured {
        return Ok(id.to_string());
    }

    loop {
        match store.get_node(ROOT_ALIAS, "").await {
            Ok(nodes) => {
                return nodes
                    .into_iter()
                    .next()
                    .map(|node| node.id)
                    .context("node store has no root node");
            }
            Err(StoreError::Transport(e)) if e.is_transient() => {
                tokio::time::sleep(STARTUP_RETRY).await;
            }
            Err(e) => return Err(e).context("resolving root node"),
        }
    }
}
