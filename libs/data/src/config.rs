//! Typed node configuration.
//!
//! Each client type pairs a config struct with the node type it governs. The
//! node type is declared as a constant rather than derived at runtime, but the
//! naming convention still holds: a config named `Foo` governs nodes of type
//! `foo` (see [`derive_node_type`]).

use crate::error::DecodeError;
use crate::node::NodeEdge;

/// A configuration decoded from a node's points.
pub trait NodeConfig: Sized + Send + 'static {
    /// Type of the nodes this config is decoded from.
    const NODE_TYPE: &'static str;

    /// Decodes the config from a node and its edge.
    fn from_node(node: &NodeEdge) -> Result<Self, DecodeError>;

    /// Fails unless `node` has type [`Self::NODE_TYPE`].
    fn check_type(node: &NodeEdge) -> Result<(), DecodeError> {
        if node.typ == Self::NODE_TYPE {
            Ok(())
        } else {
            Err(DecodeError::WrongType {
                node_id: node.id.clone(),
                expected: Self::NODE_TYPE,
                actual: node.typ.clone(),
            })
        }
    }
}

/// Node type for a config type name: first character lower-cased.
pub fn derive_node_type(type_name: &str) -> String {
    let mut chars = type_name.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}
