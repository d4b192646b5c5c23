//! Error types for the client manager.

use std::time::Duration;

use nodemesh_bus::TransportError;
use nodemesh_data::{DecodeError, EncodeError};
use thiserror::Error;

use crate::client::InstanceKey;

/// Errors returned by a [`crate::NodeStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store transport: {0}")]
    Transport(#[from] TransportError),

    #[error("store reply: {0}")]
    Decode(#[from] DecodeError),

    #[error("store request: {0}")]
    Encode(#[from] EncodeError),

    /// The store answered with an error message.
    #[error("store rejected request: {0}")]
    Rejected(String),
}

/// A scan could not query the store. The scan is skipped.
#[derive(Debug, Error)]
#[error("scan for '{node_type}' children of {root} failed: {source}")]
pub struct ScanError {
    pub root: String,
    pub node_type: &'static str,
    pub source: StoreError,
}

/// A client instance ended with a failure.
#[derive(Debug, Error)]
pub enum ConstructionError {
    /// `Client::start` returned an error.
    #[error("client failed: {0:#}")]
    Failed(anyhow::Error),

    #[error("client panicked: {0}")]
    Panicked(String),

    /// The task was aborted after ignoring a stop request.
    #[error("client aborted")]
    Aborted,
}

/// Identifies an instance that did not honor a stop request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StuckInstance {
    pub key: InstanceKey,
    pub node_id: String,
}

/// Instances still running when the shutdown grace period ran out.
#[derive(Debug, Error)]
#[error("{count} '{node_type}' client(s) did not stop within {grace:?}", count = .instances.len())]
pub struct StuckInstanceError {
    pub node_type: &'static str,
    pub grace: Duration,
    pub instances: Vec<StuckInstance>,
}

/// Errors returned by [`crate::Manager::start`].
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The node change subscription could not be set up.
    #[error("failed to subscribe to node changes: {0}")]
    Subscribe(TransportError),

    #[error(transparent)]
    Stuck(#[from] StuckInstanceError),
}
