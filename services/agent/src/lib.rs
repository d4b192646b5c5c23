//! nodemesh agent library.
//!
//! - [`store`]: in-memory node store answering store requests on the bus
//! - [`heartbeat`]: built-in heartbeat client
//! - [`server`]: wires the store and client managers together
//! - [`config`]: environment configuration

pub mod config;
pub mod heartbeat;
pub mod server;
pub mod store;

pub use config::Config;
pub use heartbeat::{Heartbeat, HeartbeatClient};
pub use server::Server;
pub use store::{GraphError, MemoryStore, StoreServer};
