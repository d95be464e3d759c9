//! Reelcast - record sessions on a capture node and push them to every
//! connected client.
//!
//! The capture node records sessions into local files, bundles finished
//! sessions into a zip archive and broadcasts that archive over long-lived
//! TCP connections using a small tagged, length-prefixed wire format.
//!
//! - **`transport`**: wire codec (`FILE` / `PING` / `QUIT`), read-exact, client connections
//! - **`server`**: connection registry, broadcaster, heartbeat supervisor, listener
//! - **`recording`**: recording state machine, bundle builder
//! - **`capture`**: file-backed capture pipeline and a synthetic frame source
//! - **`client`**: receiving-side dispatcher and archive extraction

mod error;
mod protocol;

pub mod capture;
pub mod client;
pub mod recording;
pub mod server;
pub mod transport;

pub use error::*;
pub use protocol::*;
