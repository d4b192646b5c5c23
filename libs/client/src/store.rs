//! Node store queries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use nodemesh_bus::{subject, Bus};
use nodemesh_data::pb;
use nodemesh_data::NodeEdge;
use tracing::debug;

use crate::error::StoreError;

/// Read access to the node graph.
#[async_trait]
pub trait NodeStore: Send + Sync + 'static {
    /// Returns the children of `id`. An empty `node_type` matches every type.
    ///
    /// Tombstoned edges are excluded unless `include_deleted` is set.
    async fn get_children(
        &self,
        id: &str,
        node_type: &str,
        include_deleted: bool,
        recursive: bool,
    ) -> Result<Vec<NodeEdge>, StoreError>;

    /// Returns the node `id`, once per parent edge unless `parent` narrows it.
    /// The id `"root"` resolves to the root node.
    async fn get_node(&self, id: &str, parent: &str) -> Result<Vec<NodeEdge>, StoreError>;
}

/// [`NodeStore`] backed by request/reply over the bus.
#[derive(Clone)]
pub struct BusNodeStore {
    bus: Arc<dyn Bus>,
    timeout: Duration,
}

impl BusNodeStore {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self {
            bus,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn query(&self, subject: String, payload: Vec<u8>) -> Result<Vec<NodeEdge>, StoreError> {
        debug!(subject = %subject, "Querying node store");
        let reply = self
            .bus
            .request(&subject, Bytes::from(payload), self.timeout)
            .await?;
        pb::decode_nodes(&reply.payload)?.map_err(StoreError::Rejected)
    }
}

#[async_trait]
impl NodeStore for BusNodeStore {
    async fn get_children(
        &self,
        id: &str,
        node_type: &str,
        include_deleted: bool,
        recursive: bool,
    ) -> Result<Vec<NodeEdge>, StoreError> {
        let request = pb::ChildrenRequest {
            node_type: node_type.to_string(),
            include_deleted,
            recursive,
        };
        let mut nodes = self
            .query(subject::node_children(id), request.to_bytes())
            .await?;
        if !include_deleted {
            nodes.retain(|n| !n.is_tombstone());
        }
        Ok(nodes)
    }

    async fn get_node(&self, id: &str, parent: &str) -> Result<Vec<NodeEdge>, StoreError> {
        let request = pb::NodeRequest {
            parent: parent.to_string(),
        };
        self.query(subject::node_query(id), request.to_bytes()).await
    }
}
