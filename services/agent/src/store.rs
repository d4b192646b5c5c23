//! In-memory node store.
//!
//! Holds the node graph and answers the bus side of the store protocol:
//! - `node.*.points` / `node.*.*.points`: merge incoming points (latest time wins)
//! - `node.<id>.children`: child queries
//! - `node.<id>`: node queries, with `root` resolving to the root node
//!
//! All of these arrive on one `node.>` subscription and are handled in
//! publish order, so a query always sees the points published before it.
//!
//! Accepted points are re-published on `up.none.<id>[.<parent>].points` so
//! client managers notice graph changes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use nodemesh_bus::subject::{self, PointTarget};
use nodemesh_bus::{send_points, Bus, Message, Subscription, TransportError};
use nodemesh_client::{NodeStore, StoreError};
use nodemesh_data::{
    node_type, pb, point_type, NewPoints, Node, NodeEdge, Point, Points, NONE_PARENT,
};
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Id that node queries resolve to the root node.
pub const ROOT_ALIAS: &str = "root";

/// Reasons the store refuses points.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("parent not found: {0}")]
    ParentNotFound(String),
}

// =============================================================================
// Graph
// =============================================================================

#[derive(Debug, Default)]
struct Graph {
    nodes: HashMap<String, Node>,
    /// Edge points keyed by (up, down).
    edges: BTreeMap<(String, String), Points>,
}

impl Graph {
    fn insert(&mut self, node: NodeEdge) {
        let now = Utc::now();
        let entry = self
            .nodes
            .entry(node.id.clone())
            .or_insert_with(|| Node::new(node.id.clone(), node.typ.clone()));
        if !node.typ.is_empty() {
            entry.typ = node.typ.clone();
        }

        let mut points = node.points;
        points.stamp(now);
        for point in points {
            entry.points.merge(point);
        }

        let parent = parent_or_none(&node.parent).to_string();
        let mut edge_points = node.edge_points;
        edge_points.stamp(now);
        let edge = self.edges.entry((parent, node.id)).or_default();
        for point in edge_points {
            edge.merge(point);
        }
    }

    fn root_id(&self) -> Option<&str> {
        self.edges
            .iter()
            .find(|((up, _), points)| up == NONE_PARENT && !is_tombstone(points))
            .map(|((_, down), _)| down.as_str())
    }

    fn resolve<'a>(&'a self, id: &'a str) -> Option<&'a str> {
        if id == ROOT_ALIAS && !self.nodes.contains_key(ROOT_ALIAS) {
            self.root_id()
        } else {
            Some(id)
        }
    }

    fn node_edge(&self, up: &str, down: &str, edge_points: &Points) -> Option<NodeEdge> {
        let node = self.nodes.get(down)?;
        Some(NodeEdge {
            id: node.id.clone(),
            typ: node.typ.clone(),
            parent: up.to_string(),
            points: node.points.clone(),
            edge_points: edge_points.clone(),
            hash: Vec::new(),
        })
    }

    fn children(
        &self,
        id: &str,
        node_type: &str,
        include_deleted: bool,
        recursive: bool,
    ) -> Vec<NodeEdge> {
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        self.collect_children(id, node_type, include_deleted, recursive, &mut visited, &mut out);
        out
    }

    fn collect_children(
        &self,
        id: &str,
        node_type: &str,
        include_deleted: bool,
        recursive: bool,
        visited: &mut HashSet<String>,
        out: &mut Vec<NodeEdge>,
    ) {
        if !visited.insert(id.to_string()) {
            return;
        }
        for ((up, down), edge_points) in &self.edges {
            if up != id {
                continue;
            }
            if !include_deleted && is_tombstone(edge_points) {
                continue;
            }
            let Some(child) = self.node_edge(up, down, edge_points) else {
                continue;
            };
            if recursive {
                self.collect_children(down, node_type, include_deleted, true, visited, out);
            }
            if node_type.is_empty() || child.typ == node_type {
                out.push(child);
            }
        }
    }

    fn node(&self, id: &str, parent: &str) -> Vec<NodeEdge> {
        let Some(id) = self.resolve(id) else {
            return Vec::new();
        };
        self.edges
            .iter()
            .filter(|((up, down), _)| down == id && (parent.is_empty() || up == parent))
            .filter_map(|((up, down), points)| self.node_edge(up, down, points))
            .collect()
    }

    /// Merges points addressed to `target`. Returns the points to re-publish.
    fn apply(&mut self, target: &PointTarget, points: Points) -> Result<Points, GraphError> {
        match target {
            PointTarget::Node { id } => {
                if !self.nodes.contains_key(id) {
                    let typ = points
                        .text(point_type::NODE_TYPE, "")
                        .ok_or_else(|| GraphError::NodeNotFound(id.clone()))?
                        .to_string();
                    info!(node_id = %id, node_type = %typ, "Creating node");
                    self.nodes.insert(id.clone(), Node::new(id.clone(), typ));
                }
                let node = self
                    .nodes
                    .get_mut(id)
                    .ok_or_else(|| GraphError::NodeNotFound(id.clone()))?;
                for point in points.iter().cloned() {
                    node.points.merge(point);
                }
                if let Some(typ) = node.points.text(point_type::NODE_TYPE, "") {
                    if !typ.is_empty() && typ != node.typ {
                        info!(node_id = %id, from = %node.typ, to = %typ, "Retyping node");
                        node.typ = typ.to_string();
                    }
                }
                Ok(points)
            }
            PointTarget::Edge { id, parent } => {
                let typ = self
                    .nodes
                    .get(id)
                    .map(|node| node.typ.clone())
                    .ok_or_else(|| GraphError::NodeNotFound(id.clone()))?;
                if parent != NONE_PARENT && !self.nodes.contains_key(parent) {
                    return Err(GraphError::ParentNotFound(parent.clone()));
                }

                let edge = self
                    .edges
                    .entry((parent.clone(), id.clone()))
                    .or_default();
                for point in points.iter().cloned() {
                    edge.merge(point);
                }

                // Edge changes alter graph membership, so tell managers to rescan.
                let mut notify = points;
                notify.push(Point::text(point_type::NODE_TYPE, typ).with_time(Utc::now()));
                Ok(notify)
            }
        }
    }
}

fn is_tombstone(edge_points: &Points) -> bool {
    edge_points
        .value_bool(point_type::TOMBSTONE, "")
        .unwrap_or(false)
}

fn parent_or_none(parent: &str) -> &str {
    if parent.is_empty() {
        NONE_PARENT
    } else {
        parent
    }
}

// =============================================================================
// MemoryStore
// =============================================================================

/// The node graph, shared between the bus responder and direct callers.
#[derive(Debug, Default)]
pub struct MemoryStore {
    graph: RwLock<Graph>,
}

impl MemoryStore {
    /// Builds a store from `nodes`, adding a root device node if none of them
    /// sits under `none`.
    pub fn from_nodes(nodes: Vec<NodeEdge>) -> Self {
        let mut graph = Graph::default();
        for node in nodes {
            graph.insert(node);
        }

        if graph.root_id().is_none() {
            let id = uuid::Uuid::new_v4().to_string();
            info!(root_id = %id, "Creating root node");
            graph.insert(NodeEdge {
                id,
                typ: node_type::DEVICE.to_string(),
                parent: NONE_PARENT.to_string(),
                points: Points::from(vec![Point::text(point_type::DESCRIPTION, "root")]),
                ..Default::default()
            });
        }

        Self {
            graph: RwLock::new(graph),
        }
    }

    /// Reads a JSON array of nodes.
    pub fn load_seed(path: &Path) -> anyhow::Result<Vec<NodeEdge>> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading seed file {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing seed file {}", path.display()))
    }

    pub async fn root_id(&self) -> Option<String> {
        self.graph.read().await.root_id().map(str::to_string)
    }

    pub async fn len(&self) -> usize {
        self.graph.read().await.nodes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.graph.read().await.nodes.is_empty()
    }

    pub async fn insert(&self, node: NodeEdge) {
        self.graph.write().await.insert(node);
    }

    pub async fn children(
        &self,
        id: &str,
        node_type: &str,
        include_deleted: bool,
        recursive: bool,
    ) -> Vec<NodeEdge> {
        let graph = self.graph.read().await;
        let Some(id) = graph.resolve(id) else {
            return Vec::new();
        };
        graph.children(id, node_type, include_deleted, recursive)
    }

    pub async fn node(&self, id: &str, parent: &str) -> Vec<NodeEdge> {
        self.graph.read().await.node(id, parent)
    }

    /// Merges `points` into the addressed node or edge.
    pub async fn apply(&self, target: &PointTarget, points: Points) -> Result<Points, GraphError> {
        self.graph.write().await.apply(target, points)
    }

    /// Starts answering store requests on `bus`.
    pub async fn serve(self: Arc<Self>, bus: Arc<dyn Bus>) -> Result<StoreServer, TransportError> {
        let requests = bus.subscribe(subject::NODE_ALL).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let responder = Responder {
            store: self,
            bus,
            requests,
        };
        let task = tokio::spawn(responder.run(shutdown_rx));

        Ok(StoreServer { shutdown_tx, task })
    }
}

#[async_trait]
impl NodeStore for MemoryStore {
    async fn get_children(
        &self,
        id: &str,
        node_type: &str,
        include_deleted: bool,
        recursive: bool,
    ) -> Result<Vec<NodeEdge>, StoreError> {
        Ok(self.children(id, node_type, include_deleted, recursive).await)
    }

    async fn get_node(&self, id: &str, parent: &str) -> Result<Vec<NodeEdge>, StoreError> {
        Ok(self.node(id, parent).await)
    }
}

// =============================================================================
// Responder
// =============================================================================

/// Handle on a running store responder.
#[derive(Debug)]
pub struct StoreServer {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl StoreServer {
    /// Stops answering requests and waits for the responder to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Node store task failed");
        }
    }
}

/// What a message on `node.>` asks of the store.
#[derive(Debug, PartialEq, Eq)]
enum Request<'a> {
    Points(PointTarget),
    Children(&'a str),
    Node(&'a str),
}

impl<'a> Request<'a> {
    fn parse(subject: &'a str) -> Option<Self> {
        if let Some(target) = subject::parse_point_subject(subject) {
            return Some(Request::Points(target));
        }
        let tokens: Vec<&'a str> = subject.split('.').collect();
        match tokens.as_slice() {
            ["node", id, "children"] => Some(Request::Children(*id)),
            ["node", id] => Some(Request::Node(*id)),
            _ => None,
        }
    }
}

struct Responder {
    store: Arc<MemoryStore>,
    bus: Arc<dyn Bus>,
    requests: Subscription,
}

impl Responder {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Node store serving requests");

        loop {
            tokio::select! {
                msg = self.requests.next() => {
                    let Some(msg) = msg else {
                        warn!("Node store subscription closed");
                        break;
                    };
                    self.dispatch(msg).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Node store stopped");
    }

    async fn dispatch(&self, msg: Message) {
        match Request::parse(&msg.subject) {
            Some(Request::Points(target)) => self.handle_points(target, &msg).await,
            Some(Request::Children(id)) => self.handle_children(id, &msg).await,
            Some(Request::Node(id)) => self.handle_node(id, &msg).await,
            None => debug!(subject = %msg.subject, "Ignoring message on unexpected subject"),
        }
    }

    async fn handle_points(&self, target: PointTarget, msg: &Message) {
        let points = match pb::decode_points(&msg.payload) {
            Ok(points) => points,
            Err(e) => {
                warn!(subject = %msg.subject, error = %e, "Error decoding points");
                self.reply(msg, e.to_string().into_bytes()).await;
                return;
            }
        };

        let (id, parent) = match &target {
            PointTarget::Node { id } => (id.clone(), String::new()),
            PointTarget::Edge { id, parent } => (id.clone(), parent.clone()),
        };
        debug!(
            "{}",
            NewPoints {
                id: id.clone(),
                parent: parent.clone(),
                points: points.clone(),
            }
        );

        match self.store.apply(&target, points).await {
            Ok(notify) => {
                self.reply(msg, Vec::new()).await;
                let up = if parent.is_empty() {
                    subject::up_points(NONE_PARENT, &id)
                } else {
                    subject::up_edge_points(NONE_PARENT, &id, &parent)
                };
                if let Err(e) = send_points(self.bus.as_ref(), &up, notify, false).await {
                    warn!(subject = %up, error = %e, "Error publishing node change");
                }
            }
            Err(e) => {
                warn!(node_id = %id, error = %e, "Rejected points");
                self.reply(msg, e.to_string().into_bytes()).await;
            }
        }
    }

    async fn handle_children(&self, id: &str, msg: &Message) {
        let payload = match pb::ChildrenRequest::from_bytes(&msg.payload) {
            Ok(request) => {
                let graph = self.store.graph.read().await;
                let reply = match graph.resolve(id).filter(|id| graph.nodes.contains_key(*id)) {
                    Some(id) => encode_reply(&graph.children(
                        id,
                        &request.node_type,
                        request.include_deleted,
                        request.recursive,
                    )),
                    None => pb::encode_nodes_error(
                        &GraphError::NodeNotFound(id.to_string()).to_string(),
                    ),
                };
                reply
            }
            Err(e) => pb::encode_nodes_error(&e.to_string()),
        };
        self.reply(msg, payload).await;
    }

    async fn handle_node(&self, id: &str, msg: &Message) {
        let payload = match pb::NodeRequest::from_bytes(&msg.payload) {
            Ok(request) => encode_reply(&self.store.node(id, &request.parent).await),
            Err(e) => pb::encode_nodes_error(&e.to_string()),
        };
        self.reply(msg, payload).await;
    }

    async fn reply(&self, msg: &Message, payload: Vec<u8>) {
        let Some(resp) = msg.response(Bytes::from(payload)) else {
            return;
        };
        if let Err(e) = self.bus.publish(resp).await {
            debug!(subject = %msg.subject, error = %e, "Error sending store reply");
        }
    }
}

fn encode_reply(nodes: &[NodeEdge]) -> Vec<u8> {
    pb::encode_nodes(nodes).unwrap_or_else(|e| pb::encode_nodes_error(&e.to_string()))
}
