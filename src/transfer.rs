//! File transfer engine.
//!
//! File bodies travel as raw bytes right after the control frame that
//! announces their size. Both directions stream in bounded chunks and account
//! for every byte against the declared size.

mod paths;

pub use paths::{absolute, base_name, ensure_dir, expand_path, fresh_session_dir};

use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Default receive chunk size in bytes.
pub const DEFAULT_CHUNK: usize = 4096;

/// A local file opened for sending, with the size to announce.
#[derive(Debug)]
pub struct Outgoing {
    file: File,
    path: PathBuf,
    pub size: u64,
}

impl Outgoing {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Open a regular file for sending and record its current size.
pub async fn open_outgoing(path: &Path) -> Result<Outgoing> {
    let file = File::open(path).await?;
    let meta = file.metadata().await?;
    if !meta.is_file() {
        return Err(Error::Validation(format!(
            "Not a regular file: {}",
            path.display()
        )));
    }
    Ok(Outgoing {
        file,
        path: path.to_path_buf(),
        size: meta.len(),
    })
}

/// Stream exactly `outgoing.size` bytes to `writer`.
///
/// The size must already have been announced in a control frame. A file
/// that shrank in the meantime is reported as a short transfer.
pub async fn send_file<W: AsyncWrite + Unpin>(writer: &mut W, outgoing: Outgoing) -> Result<u64> {
    let Outgoing { file, path, size } = outgoing;
    let mut limited = file.take(size);
    let sent = tokio::io::copy(&mut limited, writer).await?;
    writer.flush().await?;

    if sent != size {
        return Err(Error::ShortTransfer {
            name: path.display().to_string(),
            expected: size,
            received: sent,
        });
    }
    debug!(path = %path.display(), bytes = sent, "Sent file");
    Ok(sent)
}

/// Receive `declared` raw bytes from `reader` into `dest_dir/<basename(name)>`.
///
/// Returns the absolute path of the written file. On failure the partial
/// file is removed.
pub async fn receive_file<R: AsyncRead + Unpin>(
    reader: &mut R,
    dest_dir: &Path,
    name: &str,
    declared: u64,
    chunk_size: usize,
) -> Result<PathBuf> {
    ensure_dir(dest_dir)?;
    let file_name = base_name(name)?;
    let path = absolute(&dest_dir.join(&file_name))?;

    debug!(path = %path.display(), bytes = declared, "Receiving file");
    match write_declared(reader, &path, &file_name, declared, chunk_size).await {
        Ok(written) => {
            debug!(path = %path.display(), bytes = written, "Wrote file");
            Ok(path)
        }
        Err(e) => {
            if let Err(rm) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %rm, "Failed to remove partial file");
            }
            Err(e)
        }
    }
}

async fn write_declared<R: AsyncRead + Unpin>(
    reader: &mut R,
    path: &Path,
    name: &str,
    declared: u64,
    chunk_size: usize,
) -> Result<u64> {
    let mut file = File::create(path).await?;
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut received: u64 = 0;

    while received < declared {
        let remaining = declared - received;
        let want = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            break;
        }

        received += n as u64;
        // Unreachable with a well-behaved reader; guards one that overfills the buffer.
        if received > declared {
            return Err(Error::ProtocolOverrun {
                name: name.to_string(),
                expected: declared,
                received,
            });
        }
        file.write_all(&buf[..n]).await?;
    }
    file.flush().await?;

    if received != declared {
        return Err(Error::ShortTransfer {
            name: name.to_string(),
            expected: declared,
            received,
        });
    }
    Ok(received)
}
