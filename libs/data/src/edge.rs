//! Edges - directed, hash-verified, tombstone-capable relationships.

use serde::{Deserialize, Serialize};

use crate::point::{point_type, Points};

/// Parent id used for nodes that have no parent.
pub const NONE_PARENT: &str = "none";

/// Relationship between a parent (`up`) and a child (`down`) node.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub up: String,
    pub down: String,

    #[serde(default)]
    pub points: Points,

    /// Digest of the subtree rooted at `down`.
    #[serde(default)]
    pub hash: Vec<u8>,
}

impl Edge {
    /// Creates an edge with a fresh id. An empty `up` becomes `"none"`.
    pub fn new(up: impl Into<String>, down: impl Into<String>) -> Self {
        let up = up.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            up: if up.is_empty() {
                NONE_PARENT.to_string()
            } else {
                up
            },
            down: down.into(),
            points: Points::new(),
            hash: Vec::new(),
        }
    }

    /// Returns true if the edge points to a deleted node.
    pub fn is_tombstone(&self) -> bool {
        self.points
            .value_bool(point_type::TOMBSTONE, "")
            .unwrap_or(false)
    }
}

/// Sorts edges by id.
pub fn sort_by_id(edges: &mut [Edge]) {
    edges.sort_by(|a, b| a.id.cmp(&b.id));
}

/// Sorts edges by hash, byte-lexicographically.
pub fn sort_by_hash(edges: &mut [Edge]) {
    edges.sort_by(|a, b| a.hash.cmp(&b.hash));
}
