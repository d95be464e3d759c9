//! Transport layer: wire codec and per-client connection handles
//!
//! Provides:
//! - The tagged, length-prefixed message codec (`FILE`, `PING`, `QUIT`)
//! - A read-exact primitive that survives arbitrary fragmentation
//! - `ClientConnection`, the server's serialized write handle to one peer

pub mod codec;
mod connection;

pub use codec::{FileHeader, Message, Tag};
pub use connection::{BoxedReader, BoxedWriter, ClientConnection, ConnectionId};
