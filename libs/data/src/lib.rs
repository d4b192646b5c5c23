//! # nodemesh-data
//!
//! Data model shared by every nodemesh component.
//!
//! ## Design Principles
//!
//! - Points are immutable, timestamped facts about a node or an edge
//! - For a given (entity, type, key) the point with the latest time wins
//! - A node's type is itself a point (`nodeType`), so creation needs no
//!   dedicated message
//! - Edges are soft-deleted with a `tombstone` point and never mutated otherwise
//!
//! ## Wire Format
//!
//! Point batches and node listings travel as protobuf messages (see [`pb`]).
//! Field numbers are the schema contract; unknown fields are ignored on decode.

mod config;
mod edge;
mod error;
mod node;
pub mod pb;
mod point;

pub use config::{derive_node_type, NodeConfig};
pub use edge::{sort_by_hash, sort_by_id, Edge, NONE_PARENT};
pub use error::{DecodeError, EncodeError};
pub use node::{Node, NodeEdge};
pub use point::{node_type, point_type, NewPoints, Point, Points};
