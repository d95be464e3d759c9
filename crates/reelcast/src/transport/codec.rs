//! Wire format for messages over a TCP stream
//!
//! Every message starts with a 7-byte, space-padded ASCII tag:
//!
//! ```text
//! ┌─────────────┬──────────────────────────────────────────────────────┐
//! │ tag (7)     │ body                                                 │
//! ├─────────────┼──────────────────────────────────────────────────────┤
//! │ "FILE   "   │ payload_size (u64 BE) · name_len (u32 BE) · name ·   │
//! │             │ payload                                              │
//! │ "PING   "   │ (empty) - reply is the bare 4 bytes "PONG"           │
//! │ "QUIT   "   │ (empty) - receiver closes, no reply                  │
//! └─────────────┴──────────────────────────────────────────────────────┘
//! ```
//!
//! `payload_size == 0` means "file unavailable" and is followed by nothing.
//! There is no version field and no resynchronization marker.

use std::future::Future;
use std::io;
use std::path::Path;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    FramingError, ProtocolError, ReceiveError, CHUNK_SIZE, MAX_NAME_LEN, NAME_LENGTH_LEN,
    PAYLOAD_SIZE_LEN, TAG_LEN,
};

/// Message type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    /// A file transfer (or a "file unavailable" report)
    File,
    /// Liveness probe
    Ping,
    /// Sender is closing the connection
    Quit,
}

impl Tag {
    /// The padded on-wire representation.
    pub const fn as_bytes(self) -> &'static [u8; TAG_LEN] {
        match self {
            Tag::File => b"FILE   ",
            Tag::Ping => b"PING   ",
            Tag::Quit => b"QUIT   ",
        }
    }

    /// Parse a tag. Only the exact padded forms are accepted.
    pub fn parse(raw: &[u8; TAG_LEN]) -> Result<Self, ProtocolError> {
        [Tag::File, Tag::Ping, Tag::Quit]
            .into_iter()
            .find(|tag| tag.as_bytes() == raw)
            .ok_or(ProtocolError(*raw))
    }
}

/// A complete, in-memory message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    File { name: String, payload: Bytes },
    /// `FILE` with `payload_size == 0`
    FileUnavailable,
    Ping,
    Quit,
}

/// Header of a `FILE` message with a non-zero payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub payload_size: u64,
    /// Name exactly as received; see [`FileHeader::file_name`]
    pub raw_name: Vec<u8>,
}

impl FileHeader {
    /// Decode and validate the announced name.
    ///
    /// Only bare file names are accepted: no separators, no `.`/`..`.
    pub fn file_name(&self) -> Result<String, FramingError> {
        let name = String::from_utf8(self.raw_name.clone())?;
        if !is_bare_file_name(&name) {
            return Err(FramingError::UnsafeName(name));
        }
        Ok(name)
    }
}

fn is_bare_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
        && Path::new(name).file_name().is_some_and(|f| f == name)
}

// ========== Pure encode/decode ==========

/// Serialize the header part of a `FILE` message (tag through name).
pub fn encode_file_header(name: &str, payload_size: u64) -> Bytes {
    if payload_size == 0 {
        return encode_file_unavailable();
    }
    let name = name.as_bytes();
    let mut buf =
        BytesMut::with_capacity(TAG_LEN + PAYLOAD_SIZE_LEN + NAME_LENGTH_LEN + name.len());
    buf.put_slice(Tag::File.as_bytes());
    buf.put_u64(payload_size);
    buf.put_u32(name.len() as u32);
    buf.put_slice(name);
    buf.freeze()
}

/// Serialize the reserved "file unavailable" report.
pub fn encode_file_unavailable() -> Bytes {
    let mut buf = BytesMut::with_capacity(TAG_LEN + PAYLOAD_SIZE_LEN);
    buf.put_slice(Tag::File.as_bytes());
    buf.put_u64(0);
    buf.freeze()
}

/// Serialize a whole message.
///
/// A `File` with an empty payload cannot be distinguished from the
/// reserved report and is encoded as [`Message::FileUnavailable`].
pub fn encode(message: &Message) -> Bytes {
    match message {
        Message::File { name, payload } if !payload.is_empty() => {
            let header = encode_file_header(name, payload.len() as u64);
            let mut buf = BytesMut::with_capacity(header.len() + payload.len());
            buf.put_slice(&header);
            buf.put_slice(payload);
            buf.freeze()
        }
        Message::File { .. } | Message::FileUnavailable => encode_file_unavailable(),
        Message::Ping => Bytes::from_static(Tag::Ping.as_bytes()),
        Message::Quit => Bytes::from_static(Tag::Quit.as_bytes()),
    }
}

/// Deserialize one message from the front of `buf`.
///
/// Returns the message and the number of bytes it occupied.
pub fn decode(buf: &[u8]) -> Result<(Message, usize), ReceiveError> {
    let mut cursor = buf;

    let tag = take_array::<TAG_LEN>(&mut cursor, "tag")?;
    let tag = Tag::parse(&tag)?;
    let message = match tag {
        Tag::Ping => Message::Ping,
        Tag::Quit => Message::Quit,
        Tag::File => {
            let size = u64::from_be_bytes(take_array(&mut cursor, "payload size")?);
            if size == 0 {
                Message::FileUnavailable
            } else {
                let name_len = u32::from_be_bytes(take_array(&mut cursor, "name length")?);
                if name_len > MAX_NAME_LEN {
                    return Err(FramingError::NameTooLong(name_len).into());
                }
                let name = take_slice(&mut cursor, name_len as usize, "name")?;
                let name = String::from_utf8(name.to_vec()).map_err(FramingError::from)?;
                let size = usize::try_from(size).map_err(|_| FramingError::Truncated {
                    field: "payload",
                    expected: usize::MAX,
                    received: cursor.len(),
                })?;
                let payload = take_slice(&mut cursor, size, "payload")?;
                Message::File {
                    name,
                    payload: Bytes::copy_from_slice(payload),
                }
            }
        }
    };

    Ok((message, buf.len() - cursor.len()))
}

fn take_array<const N: usize>(
    cursor: &mut &[u8],
    field: &'static str,
) -> Result<[u8; N], FramingError> {
    let mut out = [0u8; N];
    out.copy_from_slice(take_slice(cursor, N, field)?);
    Ok(out)
}

fn take_slice<'a>(
    cursor: &mut &'a [u8],
    len: usize,
    field: &'static str,
) -> Result<&'a [u8], FramingError> {
    if cursor.remaining() < len {
        return Err(FramingError::Truncated {
            field,
            expected: len,
            received: cursor.remaining(),
        });
    }
    let (head, tail) = cursor.split_at(len);
    *cursor = tail;
    Ok(head)
}

// ========== Stream I/O ==========

/// Fill `buf` completely, looping over short reads.
///
/// Returns `Ok(false)` when the stream is already at EOF before the first
/// byte. EOF after a partial fill is [`FramingError::Truncated`].
pub async fn read_exact_or_eof<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    field: &'static str,
) -> Result<bool, FramingError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(FramingError::Truncated {
                    field,
                    expected: buf.len(),
                    received: filled,
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(FramingError::Io(e)),
        }
    }
    Ok(true)
}

/// Fill `buf` completely; EOF at any point is [`FramingError::Truncated`].
pub async fn read_exact<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    field: &'static str,
) -> Result<(), FramingError> {
    if buf.is_empty() || read_exact_or_eof(reader, buf, field).await? {
        return Ok(());
    }
    Err(FramingError::Truncated {
        field,
        expected: buf.len(),
        received: 0,
    })
}

/// Read the next tag. `Ok(None)` means the peer closed between messages.
pub async fn read_tag<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Tag>, ReceiveError> {
    let mut raw = [0u8; TAG_LEN];
    if !read_exact_or_eof(reader, &mut raw, "tag").await? {
        return Ok(None);
    }
    Ok(Some(Tag::parse(&raw)?))
}

/// Read the rest of a `FILE` header after its tag.
///
/// `Ok(None)` is the reserved "file unavailable" report.
pub async fn read_file_header<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<FileHeader>, FramingError> {
    let mut size = [0u8; PAYLOAD_SIZE_LEN];
    read_exact(reader, &mut size, "payload size").await?;
    let payload_size = u64::from_be_bytes(size);
    if payload_size == 0 {
        return Ok(None);
    }

    let mut len = [0u8; NAME_LENGTH_LEN];
    read_exact(reader, &mut len, "name length").await?;
    let name_len = u32::from_be_bytes(len);
    if name_len > MAX_NAME_LEN {
        return Err(FramingError::NameTooLong(name_len));
    }

    let mut raw_name = vec![0u8; name_len as usize];
    read_exact(reader, &mut raw_name, "name").await?;

    Ok(Some(FileHeader {
        payload_size,
        raw_name,
    }))
}

/// Write a bare tag (`PING`, `QUIT`).
pub async fn write_tag<W: AsyncWrite + Unpin>(writer: &mut W, tag: Tag) -> io::Result<()> {
    writer.write_all(tag.as_bytes()).await?;
    writer.flush().await
}

/// Write the reserved "file unavailable" report.
pub async fn write_file_unavailable<W: AsyncWrite + Unpin>(writer: &mut W) -> io::Result<()> {
    writer.write_all(&encode_file_unavailable()).await?;
    writer.flush().await
}

/// Write a complete `FILE` message, streaming `payload_size` bytes from `source`.
///
/// The payload goes out in [`CHUNK_SIZE`] pieces, each written in full.
/// `on_progress` is called with the running byte count after each chunk.
/// A `payload_size` of zero writes the "file unavailable" report instead.
///
/// With a `stall_limit`, any single write (header, chunk or flush) that
/// makes no progress for that long fails with [`io::ErrorKind::TimedOut`].
pub async fn write_file<W, R, F>(
    writer: &mut W,
    name: &str,
    payload_size: u64,
    source: &mut R,
    stall_limit: Option<Duration>,
    mut on_progress: F,
) -> io::Result<u64>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
    F: FnMut(u64),
{
    if payload_size == 0 {
        within(stall_limit, write_file_unavailable(writer)).await?;
        return Ok(0);
    }

    let header = encode_file_header(name, payload_size);
    within(stall_limit, writer.write_all(&header)).await?;

    let mut chunk = vec![0u8; CHUNK_SIZE];
    let mut sent = 0u64;
    while sent < payload_size {
        let want = (payload_size - sent).min(CHUNK_SIZE as u64) as usize;
        let n = source.read(&mut chunk[..want]).await?;
        if n == 0 {
            // Header already promised the full size
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("source ended after {sent} of {payload_size} bytes"),
            ));
        }
        within(stall_limit, writer.write_all(&chunk[..n])).await?;
        sent += n as u64;
        on_progress(sent);
    }

    within(stall_limit, writer.flush()).await?;
    Ok(sent)
}

/// Run one write, failing with `TimedOut` if it outlasts `limit`.
pub(crate) async fn within<T, Fut>(limit: Option<Duration>, write: Fut) -> io::Result<T>
where
    Fut: Future<Output = io::Result<T>>,
{
    let Some(limit) = limit else {
        return write.await;
    };
    match tokio::time::timeout(limit, write).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("peer stopped reading for {limit:?}"),
        )),
    }
}
