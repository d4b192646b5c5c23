//! # nodemesh-bus
//!
//! Publish/subscribe plumbing for points.
//!
//! - [`Bus`]: the transport seam. Implementations deliver messages by subject,
//!   with NATS-style wildcards (`*` matches one token, `>` the rest).
//! - [`MemoryBus`]: in-process implementation used by the agent and tests.
//! - [`subject`]: the subject naming scheme for node, edge and high-rate points.
//! - [`points`]: encode/send and subscribe/decode helpers built on a [`Bus`].

mod bus;
mod error;
mod memory;
pub mod points;
pub mod subject;

pub use bus::{Bus, Message, Subscription};
pub use error::TransportError;
pub use memory::MemoryBus;
pub use points::{
    send_edge_point, send_edge_points, send_node_point, send_node_points, send_points,
    subscribe_edge_points, subscribe_point_stream, subscribe_points, PointStream,
    PointSubscription, ACK_TIMEOUT,
};
