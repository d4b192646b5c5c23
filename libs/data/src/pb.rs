//! Protobuf wire messages and conversions.
//!
//! Messages are declared with `prost` derives so no code generation step is
//! needed. Field numbers must never be reused.

use chrono::{DateTime, Utc};
use prost::Message as _;

use crate::error::{DecodeError, EncodeError};
use crate::point::Points;

/// Earliest second representable by `google.protobuf.Timestamp` (0001-01-01).
const MIN_TIMESTAMP_SECONDS: i64 = -62_135_596_800;
/// Latest second representable by `google.protobuf.Timestamp` (9999-12-31).
const MAX_TIMESTAMP_SECONDS: i64 = 253_402_300_799;

#[derive(Clone, PartialEq, prost::Message)]
pub struct Point {
    #[prost(string, tag = "1")]
    pub r#type: String,
    #[prost(string, tag = "2")]
    pub key: String,
    #[prost(message, optional, tag = "3")]
    pub time: Option<prost_types::Timestamp>,
    #[prost(double, tag = "4")]
    pub value: f64,
    #[prost(string, tag = "5")]
    pub text: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PointBatch {
    #[prost(message, repeated, tag = "1")]
    pub points: Vec<Point>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct NodeEdge {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub r#type: String,
    #[prost(string, tag = "3")]
    pub parent: String,
    #[prost(message, repeated, tag = "4")]
    pub points: Vec<Point>,
    #[prost(message, repeated, tag = "5")]
    pub edge_points: Vec<Point>,
    #[prost(bytes = "vec", tag = "6")]
    pub hash: Vec<u8>,
}

/// Request payload for `node.<id>.children`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ChildrenRequest {
    /// Empty matches every type.
    #[prost(string, tag = "1")]
    pub node_type: String,
    #[prost(bool, tag = "2")]
    pub include_deleted: bool,
    #[prost(bool, tag = "3")]
    pub recursive: bool,
}

/// Request payload for `node.<id>`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct NodeRequest {
    /// Empty or `"all"` matches every parent.
    #[prost(string, tag = "1")]
    pub parent: String,
}

/// Reply to both node queries.
#[derive(Clone, PartialEq, prost::Message)]
pub struct NodesResponse {
    /// Non-empty when the store rejected the request.
    #[prost(string, tag = "1")]
    pub error: String,
    #[prost(message, repeated, tag = "2")]
    pub nodes: Vec<NodeEdge>,
}

fn timestamp_to_pb(time: &DateTime<Utc>) -> Result<prost_types::Timestamp, EncodeError> {
    let seconds = time.timestamp();
    if !(MIN_TIMESTAMP_SECONDS..=MAX_TIMESTAMP_SECONDS).contains(&seconds) {
        return Err(EncodeError::TimestampOutOfRange(*time));
    }
    Ok(prost_types::Timestamp {
        seconds,
        nanos: time.timestamp_subsec_nanos() as i32,
    })
}

fn timestamp_from_pb(ts: Option<prost_types::Timestamp>) -> Result<DateTime<Utc>, DecodeError> {
    let Some(ts) = ts else {
        return Ok(DateTime::<Utc>::default());
    };
    let invalid = DecodeError::InvalidTimestamp {
        seconds: ts.seconds,
        nanos: ts.nanos,
    };
    let nanos = u32::try_from(ts.nanos).map_err(|_| invalid.clone())?;
    DateTime::from_timestamp(ts.seconds, nanos).ok_or(invalid)
}

impl TryFrom<&crate::Point> for Point {
    type Error = EncodeError;

    fn try_from(p: &crate::Point) -> Result<Self, Self::Error> {
        Ok(Self {
            r#type: p.typ.clone(),
            key: p.key.clone(),
            time: Some(timestamp_to_pb(&p.time)?),
            value: p.value,
            text: p.text.clone(),
        })
    }
}

impl TryFrom<Point> for crate::Point {
    type Error = DecodeError;

    fn try_from(p: Point) -> Result<Self, Self::Error> {
        Ok(Self {
            time: timestamp_from_pb(p.time)?,
            typ: p.r#type,
            key: p.key,
            value: p.value,
            text: p.text,
        })
    }
}

fn points_to_pb(points: &Points) -> Result<Vec<Point>, EncodeError> {
    points.iter().map(Point::try_from).collect()
}

fn points_from_pb(points: Vec<Point>) -> Result<Points, DecodeError> {
    points.into_iter().map(crate::Point::try_from).collect()
}

impl TryFrom<&crate::NodeEdge> for NodeEdge {
    type Error = EncodeError;

    fn try_from(n: &crate::NodeEdge) -> Result<Self, Self::Error> {
        Ok(Self {
            id: n.id.clone(),
            r#type: n.typ.clone(),
            parent: n.parent.clone(),
            points: points_to_pb(&n.points)?,
            edge_points: points_to_pb(&n.edge_points)?,
            hash: n.hash.clone(),
        })
    }
}

impl TryFrom<NodeEdge> for crate::NodeEdge {
    type Error = DecodeError;

    fn try_from(n: NodeEdge) -> Result<Self, Self::Error> {
        Ok(Self {
            points: points_from_pb(n.points)?,
            edge_points: points_from_pb(n.edge_points)?,
            id: n.id,
            typ: n.r#type,
            parent: n.parent,
            hash: n.hash,
        })
    }
}

/// Encodes a point batch.
pub fn encode_points(points: &Points) -> Result<Vec<u8>, EncodeError> {
    let batch = PointBatch {
        points: points_to_pb(points)?,
    };
    Ok(batch.encode_to_vec())
}

/// Decodes a point batch.
pub fn decode_points(buf: &[u8]) -> Result<Points, DecodeError> {
    let batch = PointBatch::decode(buf)?;
    points_from_pb(batch.points)
}

/// Encodes a successful node query reply.
pub fn encode_nodes(nodes: &[crate::NodeEdge]) -> Result<Vec<u8>, EncodeError> {
    let nodes = nodes
        .iter()
        .map(NodeEdge::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(NodesResponse {
        error: String::new(),
        nodes,
    }
    .encode_to_vec())
}

/// Encodes a rejected node query reply.
pub fn encode_nodes_error(error: &str) -> Vec<u8> {
    NodesResponse {
        error: error.to_string(),
        nodes: Vec::new(),
    }
    .encode_to_vec()
}

/// Decodes a node query reply into either the nodes or the store's error text.
pub fn decode_nodes(buf: &[u8]) -> Result<Result<Vec<crate::NodeEdge>, String>, DecodeError> {
    let resp = NodesResponse::decode(buf)?;
    if !resp.error.is_empty() {
        return Ok(Err(resp.error));
    }
    let nodes = resp
        .nodes
        .into_iter()
        .map(crate::NodeEdge::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Ok(nodes))
}

impl ChildrenRequest {
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, DecodeError> {
        Ok(Self::decode(buf)?)
    }
}

impl NodeRequest {
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, DecodeError> {
        Ok(Self::decode(buf)?)
    }
}
