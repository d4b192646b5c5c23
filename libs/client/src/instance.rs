//! Supervised client instances.
//!
//! Each instance runs as two tasks: the client task executing
//! [`Client::start`], and a supervisor task that awaits it and reports the
//! outcome to the manager. Awaiting the client's `JoinHandle` contains
//! panics, so a crashing client shows up as a completion like any other.

use std::sync::Arc;

use nodemesh_bus::Bus;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinError};
use tracing::{info, warn};

use crate::client::{Client, ClientContext, InstanceKey, StopRequest, StopSignal};
use crate::error::ConstructionError;

/// Sent to the manager when an instance's client task has ended.
#[derive(Debug)]
pub(crate) struct Completion {
    pub key: InstanceKey,
    /// Distinguishes this run from a later instance registered under the same key.
    pub generation: u64,
    pub result: Result<(), ConstructionError>,
}

/// The manager's handle on one running instance.
#[derive(Debug)]
pub(crate) struct InstanceHandle {
    key: InstanceKey,
    generation: u64,
    stop_tx: watch::Sender<Option<StopRequest>>,
    client_task: AbortHandle,
    stop_requested: bool,
}

impl InstanceHandle {
    pub fn spawn(
        key: InstanceKey,
        generation: u64,
        node_type: &'static str,
        bus: Arc<dyn Bus>,
        mut client: Box<dyn Client>,
        done: mpsc::Sender<Completion>,
    ) -> Self {
        let (stop_tx, stop) = StopSignal::channel();
        let ctx = ClientContext {
            key: key.clone(),
            bus,
            stop,
        };

        let client_task = tokio::spawn(async move { client.start(ctx).await });
        let abort = client_task.abort_handle();

        let supervised = key.clone();
        tokio::spawn(async move {
            let result = match client_task.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(ConstructionError::Failed(e)),
                Err(join) => Err(join_failure(join)),
            };

            match &result {
                Ok(()) => info!(
                    node_type,
                    node_id = %supervised.id,
                    parent = %supervised.parent,
                    "Client stopped"
                ),
                Err(e) => warn!(
                    node_type,
                    node_id = %supervised.id,
                    parent = %supervised.parent,
                    error = %e,
                    "Client stopped with error"
                ),
            }

            // The manager may already be gone during shutdown.
            let _ = done
                .send(Completion {
                    key: supervised,
                    generation,
                    result,
                })
                .await;
        });

        Self {
            key,
            generation,
            stop_tx,
            client_task: abort,
            stop_requested: false,
        }
    }

    pub fn key(&self) -> &InstanceKey {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    /// Signals the client to stop. Returns `false` if it was already signalled.
    pub fn stop(&mut self, error: Option<String>) -> bool {
        if self.stop_requested {
            return false;
        }
        self.stop_requested = true;
        // A send error means the client already returned; its completion is on the way.
        let _ = self.stop_tx.send(Some(StopRequest { error }));
        true
    }

    /// Cancels the client task outright.
    pub fn abort(&self) {
        self.client_task.abort();
    }
}

fn join_failure(err: JoinError) -> ConstructionError {
    if err.is_cancelled() {
        return ConstructionError::Aborted;
    }
    let panic = err.into_panic();
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    ConstructionError::Panicked(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nodemesh_bus::MemoryBus;
    use std::time::Duration;

    fn spawn(id: &str, client: Box<dyn Client>, done: mpsc::Sender<Completion>) -> InstanceHandle {
        InstanceHandle::spawn(
            InstanceKey::new("root", id),
            7,
            "bus",
            Arc::new(MemoryBus::new()),
            client,
            done,
        )
    }

    struct WaitForStop;

    #[async_trait]
    impl Client for WaitForStop {
        async fn start(&mut self, mut ctx: ClientContext) -> anyhow::Result<()> {
            ctx.stop.stopped().await;
            Ok(())
        }
    }

    struct Panics;

    #[async_trait]
    impl Client for Panics {
        async fn start(&mut self, _ctx: ClientContext) -> anyhow::Result<()> {
            panic!("sensor exploded");
        }
    }

    struct Fails;

    #[async_trait]
    impl Client for Fails {
        async fn start(&mut self, _ctx: ClientContext) -> anyhow::Result<()> {
            anyhow::bail!("port busy")
        }
    }

    async fn completion(rx: &mut mpsc::Receiver<Completion>) -> Completion {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("completion in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn test_stop_completes_cleanly() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut handle = spawn("b1", Box::new(WaitForStop), tx);

        assert!(handle.stop(None));
        assert!(!handle.stop(None));
        assert!(handle.stop_requested());

        let done = completion(&mut rx).await;
        assert_eq!(done.key, InstanceKey::new("root", "b1"));
        assert_eq!(done.generation, 7);
        assert!(done.result.is_ok());
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let (tx, mut rx) = mpsc::channel(4);
        let _handle = spawn("p1", Box::new(Panics), tx);

        match completion(&mut rx).await.result {
            Err(ConstructionError::Panicked(msg)) => assert_eq!(msg, "sensor exploded"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_error_is_reported() {
        let (tx, mut rx) = mpsc::channel(4);
        let _handle = spawn("f1", Box::new(Fails), tx);

        let err = completion(&mut rx).await.result.unwrap_err();
        assert_eq!(err.to_string(), "client failed: port busy");
    }

    #[tokio::test]
    async fn test_abort_reports_aborted() {
        let (tx, mut rx) = mpsc::channel(4);
        let handle = spawn("a1", Box::new(WaitForStop), tx);

        handle.abort();
        assert!(matches!(
            completion(&mut rx).await.result,
            Err(ConstructionError::Aborted)
        ));
    }
}
