//! The client capability implemented by node-type-specific workers.

use std::fmt;

use std::sync::Arc;

use async_trait::async_trait;
use nodemesh_bus::Bus;
use tokio::sync::watch;

/// Identifies one supervised instance: the node and the parent it sits under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    pub parent: String,
    pub id: String,
}

impl InstanceKey {
    pub fn new(parent: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            parent: parent.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.parent, self.id)
    }
}

/// Why a client was asked to stop. `error` is `None` for a clean shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StopRequest {
    pub error: Option<String>,
}

impl StopRequest {
    pub fn clean() -> Self {
        Self { error: None }
    }

    pub fn with_error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
        }
    }
}

/// Receiving side of a client's stop signal.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<Option<StopRequest>>,
}

impl StopSignal {
    pub(crate) fn new(rx: watch::Receiver<Option<StopRequest>>) -> Self {
        Self { rx }
    }

    /// Returns a signal and the sender that triggers it.
    pub fn channel() -> (watch::Sender<Option<StopRequest>>, Self) {
        let (tx, rx) = watch::channel(None);
        (tx, Self::new(rx))
    }

    pub fn is_stopped(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Resolves once a stop has been requested. Cancel safe; resolves
    /// immediately if the stop was already requested.
    ///
    /// A dropped sender counts as a clean stop.
    pub async fn stopped(&mut self) -> StopRequest {
        loop {
            if let Some(request) = self.rx.borrow_and_update().clone() {
                return request;
            }
            if self.rx.changed().await.is_err() {
                return StopRequest::clean();
            }
        }
    }
}

/// Context handed to [`Client::start`].
#[derive(Clone)]
pub struct ClientContext {
    pub key: InstanceKey,
    pub bus: Arc<dyn Bus>,
    pub stop: StopSignal,
}

impl fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientContext")
            .field("key", &self.key)
            .field("stop", &self.stop)
            .finish_non_exhaustive()
    }
}

/// A worker bound to one graph node.
#[async_trait]
pub trait Client: Send + 'static {
    /// Runs until `ctx.stop` fires or the client gives up on its own.
    ///
    /// Returning without a stop request tells the manager to tear the
    /// instance down; it is rebuilt on the next scan if the node is still
    /// present. An `Err` is logged and treated the same way.
    async fn start(&mut self, ctx: ClientContext) -> anyhow::Result<()>;
}

#[async_trait]
impl Client for Box<dyn Client> {
    async fn start(&mut self, ctx: ClientContext) -> anyhow::Result<()> {
        (**self).start(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stop_signal_carries_error() {
        let (tx, mut signal) = StopSignal::channel();
        assert!(!signal.is_stopped());

        tx.send(Some(StopRequest::with_error("shutting down"))).unwrap();
        let request = signal.stopped().await;
        assert_eq!(request.error.as_deref(), Some("shutting down"));

        // Level triggered: asking again returns the same request.
        assert_eq!(signal.stopped().await, request);
    }

    #[tokio::test]
    async fn test_dropped_sender_is_clean_stop() {
        let (tx, mut signal) = StopSignal::channel();
        drop(tx);
        let request = tokio::time::timeout(Duration::from_secs(1), signal.stopped())
            .await
            .unwrap();
        assert_eq!(request, StopRequest::clean());
    }

    #[test]
    fn test_instance_key_display() {
        assert_eq!(InstanceKey::new("root", "b1").to_string(), "root/b1");
    }
}
