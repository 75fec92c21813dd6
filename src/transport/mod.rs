//! Frame codec for client ↔ server communication.
//!
//! Every control message travels as one frame:
//! [4-byte big-endian length][payload bytes]
//!
//! Raw file bodies follow their control frame unframed; see `crate::transfer`.

pub mod protocol;

pub use protocol::{Keywords, Request, Response};

use std::io::ErrorKind;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Default ceiling the server applies to incoming frames (64 MB).
pub const DEFAULT_MAX_FRAME: u32 = 64 * 1024 * 1024;

/// Write a length-prefixed frame and flush.
pub async fn send_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::Malformed(format!("Frame too large: {} bytes", payload.len())))?;

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame with no size ceiling.
///
/// Returns `None` when the peer closes before a complete frame arrived,
/// either inside the length prefix or inside the payload.
pub async fn recv_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    recv_frame_limited(reader, u32::MAX).await
}

/// Read one frame, rejecting declared lengths above `max_len`.
pub async fn recv_frame_limited<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_len: u32,
) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    if !read_exact_or_eof(reader, &mut len_buf).await? {
        return Ok(None);
    }
    let len = u32::from_be_bytes(len_buf);

    if len > max_len {
        return Err(Error::Malformed(format!(
            "Frame exceeds max size: {len} > {max_len}"
        )));
    }

    let mut buf = vec![0u8; len as usize];
    if !read_exact_or_eof(reader, &mut buf).await? {
        return Ok(None);
    }
    Ok(Some(buf))
}

/// Fill `buf` completely. `Ok(false)` means the stream ended first.
async fn read_exact_or_eof<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}
