//! Error types for encoding and decoding points and node configuration.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur when decoding a point batch or a typed node config.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecodeError {
    /// The protobuf payload is malformed.
    #[error("malformed payload: {0}")]
    Wire(String),

    /// A timestamp on the wire cannot be represented.
    #[error("invalid timestamp: {seconds}s {nanos}ns")]
    InvalidTimestamp { seconds: i64, nanos: i32 },

    /// A point required by the node config is absent.
    #[error("node {node_id}: missing point '{point_type}'")]
    MissingPoint { node_id: String, point_type: String },

    /// A point is present but its value is not usable.
    #[error("node {node_id}: invalid point '{point_type}': {reason}")]
    InvalidPoint {
        node_id: String,
        point_type: String,
        reason: String,
    },

    /// The node is not of the type the config describes.
    #[error("node {node_id}: expected type '{expected}', got '{actual}'")]
    WrongType {
        node_id: String,
        expected: &'static str,
        actual: String,
    },
}

impl From<prost::DecodeError> for DecodeError {
    fn from(err: prost::DecodeError) -> Self {
        DecodeError::Wire(err.to_string())
    }
}

/// Errors that can occur when encoding points.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// The point time falls outside the protobuf timestamp range.
    #[error("timestamp out of range: {0}")]
    TimestampOutOfRange(DateTime<Utc>),
}
