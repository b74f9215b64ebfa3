use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::ProtocolConfig;
use crate::error::{BuildfarmError, ProtocolError, Result};
use crate::protocol::file;
use crate::protocol::MessageType;

pub const HEADER_LEN: usize = 9;

/// Fixed-size frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub length: u64,
    pub kind: MessageType,
}

impl Header {
    pub fn new(length: u64, kind: MessageType) -> Self {
        Self { length, kind }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[..8].copy_from_slice(&self.length.to_be_bytes());
        bytes[8] = self.kind.tag();
        bytes
    }

    pub fn decode(bytes: &[u8; HEADER_LEN]) -> std::result::Result<Self, ProtocolError> {
        let mut length = [0u8; 8];
        length.copy_from_slice(&bytes[..8]);
        let kind = MessageType::from_tag(bytes[8]).ok_or(ProtocolError::UnknownType(bytes[8]))?;
        Ok(Self {
            length: u64::from_be_bytes(length),
            kind,
        })
    }
}

pub(crate) fn closed(e: std::io::Error) -> BuildfarmError {
    ProtocolError::Closed(e).into()
}

pub async fn write_header<W>(writer: &mut W, header: Header) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&header.encode()).await.map_err(closed)
}

pub async fn read_header<R>(reader: &mut R) -> Result<Header>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = [0u8; HEADER_LEN];
    reader.read_exact(&mut bytes).await.map_err(closed)?;
    Ok(Header::decode(&bytes)?)
}

/// Read headers until one that is not a heartbeat arrives.
pub async fn read_header_ignoring_heartbeat<R>(reader: &mut R) -> Result<Header>
where
    R: AsyncRead + Unpin,
{
    loop {
        let header = read_header(reader).await?;
        if header.kind != MessageType::Heartbeat {
            return Ok(header);
        }
        if header.length != 0 {
            return Err(ProtocolError::Malformed(format!(
                "heartbeat carried {} body bytes",
                header.length
            ))
            .into());
        }
        tracing::trace!("Heartbeat received");
    }
}

/// Write one complete frame and flush it.
pub async fn send<W>(writer: &mut W, body: &[u8], kind: MessageType) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_header(writer, Header::new(body.len() as u64, kind)).await?;
    writer.write_all(body).await.map_err(closed)?;
    writer.flush().await.map_err(closed)
}

pub async fn send_heartbeat<W>(writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    send(writer, &[], MessageType::Heartbeat).await
}

/// Tell the peer the exchange failed. The body is a human readable reason.
pub async fn send_error<W>(writer: &mut W, message: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    send(writer, message.as_bytes(), MessageType::Error).await
}

pub async fn send_string<W>(writer: &mut W, message: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    send(writer, message.as_bytes(), MessageType::String).await
}

pub async fn send_record<W, T>(writer: &mut W, record: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(record)?;
    send(writer, &body, MessageType::Record).await
}

async fn read_body<R>(reader: &mut R, header: Header, limit: u64) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    if header.length > limit {
        return Err(ProtocolError::Oversized {
            size: header.length,
            limit,
        }
        .into());
    }
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await.map_err(closed)?;
    Ok(body)
}

/// Read the body that follows `header`, checking it against `expected`.
pub async fn receive_body<R>(
    reader: &mut R,
    header: Header,
    expected: MessageType,
    limit: u64,
) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    if header.kind == MessageType::Error && expected != MessageType::Error {
        let body = read_body(reader, header, limit).await?;
        return Err(ProtocolError::Remote(String::from_utf8_lossy(&body).into_owned()).into());
    }
    if header.kind != expected {
        return Err(ProtocolError::TypeMismatch {
            expected,
            actual: header.kind,
        }
        .into());
    }
    read_body(reader, header, limit).await
}

/// Receive one frame of exactly the `expected` type.
pub async fn receive<R>(reader: &mut R, expected: MessageType, limit: u64) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let header = read_header(reader).await?;
    receive_body(reader, header, expected, limit).await
}

/// Like [`receive`] but silently consumes heartbeats first.
pub async fn receive_ignoring_heartbeat<R>(
    reader: &mut R,
    expected: MessageType,
    limit: u64,
) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let header = read_header_ignoring_heartbeat(reader).await?;
    receive_body(reader, header, expected, limit).await
}

pub fn decode_string(body: Vec<u8>) -> Result<String> {
    String::from_utf8(body)
        .map_err(|e| ProtocolError::Malformed(format!("string body is not UTF-8: {}", e)).into())
}

pub fn decode_record<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|e| ProtocolError::Malformed(format!("invalid record: {}", e)).into())
}

/// A bidirectional stream speaking the framed protocol.
///
/// Used for short-lived exchanges that need no liveness monitoring, such as
/// queue checkout and status requests.
pub struct Messenger<S> {
    stream: S,
    config: ProtocolConfig,
}

impl<S> Messenger<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, config: ProtocolConfig) -> Self {
        Self { stream, config }
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    pub async fn send_string(&mut self, message: &str) -> Result<()> {
        send_string(&mut self.stream, message).await
    }

    pub async fn send_record<T: Serialize>(&mut self, record: &T) -> Result<()> {
        send_record(&mut self.stream, record).await
    }

    pub async fn send_error(&mut self, message: &str) -> Result<()> {
        send_error(&mut self.stream, message).await
    }

    pub async fn send_heartbeat(&mut self) -> Result<()> {
        send_heartbeat(&mut self.stream).await
    }

    pub async fn receive_string(&mut self) -> Result<String> {
        let body = receive_ignoring_heartbeat(
            &mut self.stream,
            MessageType::String,
            self.config.max_message_size,
        )
        .await?;
        decode_string(body)
    }

    pub async fn receive_record<T: DeserializeOwned>(&mut self) -> Result<T> {
        let body = receive_ignoring_heartbeat(
            &mut self.stream,
            MessageType::Record,
            self.config.max_message_size,
        )
        .await?;
        decode_record(&body)
    }

    pub async fn send_file(&mut self, path: &std::path::Path) -> Result<u64> {
        file::send_file(&mut self.stream, path, self.config.chunk_size).await
    }

    pub async fn receive_file(&mut self, path: &std::path::Path) -> Result<u64> {
        file::receive_file(&mut self.stream, path, self.config.chunk_size).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_big_endian_length_then_tag() {
        let header = Header::new(0x0102, MessageType::File);
        let bytes = header.encode();
        assert_eq!(bytes, [0, 0, 0, 0, 0, 0, 0x01, 0x02, 2]);
        assert_eq!(Header::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn header_with_unknown_tag_is_rejected() {
        let mut bytes = Header::new(0, MessageType::String).encode();
        bytes[8] = 42;
        assert!(matches!(
            Header::decode(&bytes),
            Err(ProtocolError::UnknownType(42))
        ));
    }

    #[test]
    fn decode_string_rejects_invalid_utf8() {
        assert!(decode_string(vec![0xff, 0xfe]).is_err());
        assert_eq!(decode_string(b"ok".to_vec()).unwrap(), "ok");
    }
}
