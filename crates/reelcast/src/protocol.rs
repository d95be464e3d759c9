//! Protocol constants shared by both ends of a connection

use std::time::Duration;

/// Default TCP port the capture node listens on
pub const DEFAULT_PORT: u16 = 8080;

/// Every message starts with a tag of exactly this many bytes
pub const TAG_LEN: usize = 7;

/// Size of the `payload_size` field of a `FILE` body (big-endian u64)
pub const PAYLOAD_SIZE_LEN: usize = 8;

/// Size of the `name_length` field of a `FILE` body (big-endian u32)
pub const NAME_LENGTH_LEN: usize = 4;

/// Upper bound on an announced file name. Names are bare file names,
/// so anything longer is treated as a corrupt header.
pub const MAX_NAME_LEN: u32 = 4096;

/// Reply token for `PING`. Sent as-is, not tag-padded.
pub const PONG: &[u8; 4] = b"PONG";

/// Transport-level chunk size used when streaming a payload
pub const CHUNK_SIZE: usize = 4096;

/// Default interval between heartbeat probes
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(1);

/// Default limit on a single stalled write to a client
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);
