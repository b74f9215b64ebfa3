use std::path::Path;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{BuildfarmError, ProtocolError, Result};
use crate::protocol::codec::{closed, read_header_ignoring_heartbeat, write_header, Header};
use crate::protocol::MessageType;

/// Bytes of the CRC-32C trailer that follows a file body.
pub const CHECKSUM_LEN: usize = 4;

/// Running CRC-32C over a byte stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Checksum(u32);

impl Checksum {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.0 = crc32c::crc32c_append(self.0, bytes);
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

/// Stream `length` bytes from `source` as a `file` message.
///
/// The body is written in chunks of at most `chunk_size` bytes and followed by
/// the checksum trailer. Returns the checksum that was sent.
pub async fn send_file_from<W, R>(
    writer: &mut W,
    source: &mut R,
    length: u64,
    chunk_size: usize,
) -> Result<u32>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let chunk_size = chunk_size.max(1);
    write_header(writer, Header::new(length, MessageType::File)).await?;

    let mut checksum = Checksum::new();
    let mut buffer = vec![0u8; chunk_size];
    let mut remaining = length;
    while remaining > 0 {
        let len = remaining.min(chunk_size as u64) as usize;
        let chunk = &mut buffer[..len];
        source.read_exact(chunk).await?;
        checksum.update(chunk);
        writer.write_all(chunk).await.map_err(closed)?;
        remaining -= len as u64;
    }

    writer
        .write_all(&checksum.value().to_be_bytes())
        .await
        .map_err(closed)?;
    writer.flush().await.map_err(closed)?;
    Ok(checksum.value())
}

/// Send the file at `path`. Returns the number of body bytes sent.
pub async fn send_file<W>(writer: &mut W, path: &Path, chunk_size: usize) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut file = tokio::fs::File::open(path).await?;
    let length = file.metadata().await?.len();
    let checksum = send_file_from(writer, &mut file, length, chunk_size).await?;
    tracing::debug!(path = %path.display(), bytes = length, checksum, "File sent");
    Ok(length)
}

/// Receive a `file` message into `sink`, verifying the trailer.
///
/// Leading heartbeats are skipped. On a checksum mismatch the bytes already
/// written to `sink` are invalid and must be discarded by the caller.
pub async fn receive_file_into<R, W>(reader: &mut R, sink: &mut W, chunk_size: usize) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let header = read_header_ignoring_heartbeat(reader).await?;
    if header.kind == MessageType::Error {
        let mut body = vec![0u8; header.length.min(64 * 1024) as usize];
        reader.read_exact(&mut body).await.map_err(closed)?;
        return Err(ProtocolError::Remote(String::from_utf8_lossy(&body).into_owned()).into());
    }
    if header.kind != MessageType::File {
        return Err(ProtocolError::TypeMismatch {
            expected: MessageType::File,
            actual: header.kind,
        }
        .into());
    }

    let chunk_size = chunk_size.max(1);
    let mut checksum = Checksum::new();
    let mut buffer = vec![0u8; chunk_size];
    let mut remaining = header.length;
    while remaining > 0 {
        let len = remaining.min(chunk_size as u64) as usize;
        let chunk = &mut buffer[..len];
        reader.read_exact(chunk).await.map_err(closed)?;
        checksum.update(chunk);
        sink.write_all(chunk).await?;
        remaining -= len as u64;
    }
    sink.flush().await?;

    let mut trailer = [0u8; CHECKSUM_LEN];
    reader.read_exact(&mut trailer).await.map_err(closed)?;
    let expected = u32::from_be_bytes(trailer);
    if expected != checksum.value() {
        return Err(BuildfarmError::Integrity {
            expected,
            actual: checksum.value(),
        });
    }
    Ok(header.length)
}

/// Receive a file into `path`, removing the destination on any failure.
pub async fn receive_file<R>(reader: &mut R, path: &Path, chunk_size: usize) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut file = tokio::fs::File::create(path).await?;
    let result = receive_file_into(reader, &mut file, chunk_size).await;
    drop(file);

    match result {
        Ok(bytes) => {
            tracing::debug!(path = %path.display(), bytes, "File received");
            Ok(bytes)
        }
        Err(e) => {
            if let Err(remove_err) = tokio::fs::remove_file(path).await {
                tracing::warn!(
                    path = %path.display(),
                    error = %remove_err,
                    "Failed to discard partial file"
                );
            }
            Err(e)
        }
    }
}
