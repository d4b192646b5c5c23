//! Nodes of the configuration graph.

use serde::{Deserialize, Serialize};

use crate::edge::NONE_PARENT;
use crate::point::{point_type, Points};

/// A configuration or state entity, described entirely by its points.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Node {
    pub id: String,

    #[serde(rename = "type")]
    pub typ: String,

    #[serde(default)]
    pub points: Points,
}

impl Node {
    pub fn new(id: impl Into<String>, typ: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            typ: typ.into(),
            points: Points::new(),
        }
    }

    /// Returns the node's description point, or an empty string.
    pub fn description(&self) -> &str {
        self.points
            .text(point_type::DESCRIPTION, "")
            .unwrap_or_default()
    }
}

/// A node together with the edge that places it under `parent`.
///
/// Store queries return this shape so callers know the node's position in the
/// graph as well as its content.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeEdge {
    pub id: String,

    #[serde(rename = "type")]
    pub typ: String,

    /// Parent node id, or `"none"` for the root.
    #[serde(default)]
    pub parent: String,

    #[serde(default)]
    pub points: Points,

    #[serde(default)]
    pub edge_points: Points,

    /// Digest of the subtree rooted at this node, maintained by the store.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hash: Vec<u8>,
}

impl NodeEdge {
    /// Returns true if the edge to the parent has been soft-deleted.
    pub fn is_tombstone(&self) -> bool {
        self.edge_points
            .value_bool(point_type::TOMBSTONE, "")
            .unwrap_or(false)
    }

    /// Returns true if the node sits directly under no parent.
    pub fn is_root(&self) -> bool {
        self.parent.is_empty() || self.parent == NONE_PARENT
    }

    pub fn description(&self) -> &str {
        self.points
            .text(point_type::DESCRIPTION, "")
            .unwrap_or_default()
    }

    /// Drops the edge context.
    pub fn to_node(&self) -> Node {
        Node {
            id: self.id.clone(),
            typ: self.typ.clone(),
            points: self.points.clone(),
        }
    }
}
