//! Subject naming for point delivery.
//!
//! ```text
//! node.<id>.points            points for a node
//! node.<id>.<parent>.points   points for the edge placing <id> under <parent>
//! node.*.points               any node
//! node.*.*.points             any edge
//! phr.<id>                    high-rate points, not archived like the above
//! up.<up>.<id>.points         node points re-published toward ancestor <up>
//! up.none.>                   everything re-published to the top of the tree
//! node.<id>.children          store query: children of <id>
//! node.<id>                   store query: the node itself
//! node.>                      everything the store answers
//! ```

use nodemesh_data::NONE_PARENT;

use crate::error::TransportError;

/// Wildcard receiving every point re-published to the top of the tree.
pub const UP_NONE_ALL: &str = "up.none.>";

/// Wildcard receiving point updates and store queries alike.
pub const NODE_ALL: &str = "node.>";

pub fn node_points(node_id: &str) -> String {
    format!("node.{}.points", node_id)
}

/// An empty `parent_id` is addressed as `"none"`.
pub fn edge_points(node_id: &str, parent_id: &str) -> String {
    format!("node.{}.{}.points", node_id, parent_or_none(parent_id))
}

pub fn node_all_points() -> &'static str {
    "node.*.points"
}

pub fn edge_all_points() -> &'static str {
    "node.*.*.points"
}

pub fn node_hr_points(node_id: &str) -> String {
    format!("phr.{}", node_id)
}

pub fn up_points(up_id: &str, node_id: &str) -> String {
    format!("up.{}.{}.points", parent_or_none(up_id), node_id)
}

pub fn up_edge_points(up_id: &str, node_id: &str, parent_id: &str) -> String {
    format!(
        "up.{}.{}.{}.points",
        parent_or_none(up_id),
        node_id,
        parent_or_none(parent_id)
    )
}

pub fn node_children(node_id: &str) -> String {
    format!("node.{}.children", node_id)
}

pub fn node_query(node_id: &str) -> String {
    format!("node.{}", node_id)
}

/// Unique reply subject for a request.
pub fn new_inbox() -> String {
    format!("_INBOX.{}", uuid::Uuid::new_v4().simple())
}

fn parent_or_none(parent_id: &str) -> &str {
    if parent_id.is_empty() {
        NONE_PARENT
    } else {
        parent_id
    }
}

/// Entity addressed by a concrete point subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PointTarget {
    Node { id: String },
    Edge { id: String, parent: String },
}

/// Parses `node.<id>.points` and `node.<id>.<parent>.points`.
pub fn parse_point_subject(subject: &str) -> Option<PointTarget> {
    let tokens: Vec<&str> = subject.split('.').collect();
    match tokens.as_slice() {
        ["node", id, "points"] => Some(PointTarget::Node { id: id.to_string() }),
        ["node", id, parent, "points"] => Some(PointTarget::Edge {
            id: id.to_string(),
            parent: parent.to_string(),
        }),
        _ => None,
    }
}

/// Checks that a subject is concrete enough to publish on.
pub fn validate_publish(subject: &str) -> Result<(), TransportError> {
    let valid = !subject.is_empty()
        && subject
            .split('.')
            .all(|t| !t.is_empty() && t != "*" && t != ">" && !t.contains(char::is_whitespace));
    if valid {
        Ok(())
    } else {
        Err(TransportError::InvalidSubject(subject.to_string()))
    }
}

/// Checks that a subscription pattern is well formed (`>` only in last place).
pub fn validate_pattern(pattern: &str) -> Result<(), TransportError> {
    let tokens: Vec<&str> = pattern.split('.').collect();
    let last = tokens.len().saturating_sub(1);
    let valid = !pattern.is_empty()
        && tokens.iter().enumerate().all(|(i, t)| {
            !t.is_empty() && !t.contains(char::is_whitespace) && (*t != ">" || i == last)
        });
    if valid {
        Ok(())
    } else {
        Err(TransportError::InvalidSubject(pattern.to_string()))
    }
}

/// Returns true if `subject` matches `pattern`.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');
    loop {
        match (pat.next(), sub.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
