//! Capture-node networking
//!
//! - `ConnectionRegistry`: the set of live downstream clients
//! - `Server`: TCP accept loop; spawns a heartbeat supervisor per client
//! - `Broadcaster` / `BroadcastWorker`: push bundles to every client

mod broadcast;
mod heartbeat;
mod listener;
mod registry;

pub use broadcast::{
    BroadcastHandle, BroadcastReport, BroadcastWorker, Broadcaster, TransferOutcome,
    TransferSession,
};
pub use heartbeat::{supervise, HeartbeatConfig};
pub use listener::{Server, ServerConfig};
pub use registry::{ConnectionRegistry, RegistryStats};
