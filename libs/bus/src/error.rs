//! Transport errors.

use std::time::Duration;

use nodemesh_data::EncodeError;
use thiserror::Error;

/// Errors surfaced by bus operations and point sends.
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    /// The point batch could not be encoded.
    #[error("encode failed: {0}")]
    Encode(#[from] EncodeError),

    /// The bus connection is closed.
    #[error("bus connection closed")]
    Closed,

    /// A request was published but nobody is subscribed to answer it.
    #[error("no responders for '{subject}'")]
    NoResponders { subject: String },

    /// No reply arrived in time.
    #[error("timeout after {timeout:?} waiting for reply on '{subject}'")]
    Timeout { subject: String, timeout: Duration },

    /// The remote answered with an error message.
    #[error("rejected by remote: {0}")]
    Rejected(String),

    /// The subject is empty or malformed.
    #[error("invalid subject '{0}'")]
    InvalidSubject(String),
}

impl TransportError {
    /// Returns true if retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout { .. } | TransportError::NoResponders { .. }
        )
    }
}
