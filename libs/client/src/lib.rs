//! # nodemesh-client
//!
//! Keeps one running [`Client`] per graph node of a given type.
//!
//! ## Architecture
//!
//! ```text
//! Manager<C>                    (one per node type, owns the instance map)
//! ├── up.none.> subscription    (nodeType points trigger a rescan)
//! ├── periodic rescan           (safety net for missed notifications)
//! └── Instance(parent, id)      (supervisor task + client task)
//!     └── Client::start         (subscribes to its own node's points)
//! ```
//!
//! Scan triggers, stop requests and instance completions all arrive as
//! messages into the manager loop, so the instance map needs no lock.

mod client;
mod error;
mod instance;
mod manager;
mod store;

pub use client::{Client, ClientContext, InstanceKey, StopRequest, StopSignal};
pub use error::{
    ConstructionError, ManagerError, ScanError, StoreError, StuckInstance, StuckInstanceError,
};
pub use manager::{Manager, ManagerHandle, ManagerOptions, MIN_SCAN_INTERVAL};
pub use store::{BusNodeStore, NodeStore};
