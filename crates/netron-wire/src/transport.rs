//! Byte-stream transports carrying framed wire messages.
//!
//! A [`Connection`] is the collaborator the protocol core is handed for each
//! peer: an ordered, reliable, bidirectional message stream split into a
//! [`MessageSink`] and a [`MessageSource`]. Any `AsyncRead + AsyncWrite`
//! stream (TCP, an in-process duplex pipe) can back one.

use crate::message::{decode_length, encode_message, WireMessage};
use async_trait::async_trait;
use netron_types::config::DEFAULT_MAX_MESSAGE_SIZE;
use netron_types::NetronError;
use serde::Deserialize;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Errors from the transport layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// Valid JSON that is not a known message. The envelope fields that
    /// could be read are kept so the frame can still be answered.
    #[error("Undecodable {frame_type:?} frame {id:?}: {reason}")]
    Undecodable {
        id: Option<u64>,
        frame_type: Option<String>,
        reason: String,
    },
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("Protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch { local: u32, remote: u32 },
}

impl From<WireError> for NetronError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Io(io) => NetronError::Io(io),
            WireError::Json(json) => NetronError::Serialization(json.to_string()),
            WireError::Undecodable { reason, .. } => NetronError::Serialization(reason),
            WireError::HandshakeFailed(msg) => NetronError::HandshakeFailed(msg),
            WireError::VersionMismatch { local, remote } => NetronError::HandshakeFailed(format!(
                "Protocol version mismatch: local={local}, remote={remote}"
            )),
            other => NetronError::Transport(other.to_string()),
        }
    }
}

/// Outgoing half of a connection.
#[async_trait]
pub trait MessageSink: Send + 'static {
    /// Write one message.
    async fn send(&mut self, msg: &WireMessage) -> Result<(), WireError>;
}

/// Incoming half of a connection.
#[async_trait]
pub trait MessageSource: Send + 'static {
    /// Read the next message. Returns [`WireError::ConnectionClosed`] at end
    /// of stream. [`WireError::Json`] and [`WireError::Undecodable`] leave
    /// the stream usable.
    async fn recv(&mut self) -> Result<WireMessage, WireError>;
}

/// Writes length-prefixed JSON frames.
pub struct FramedWriter<W> {
    inner: W,
    max_size: u32,
}

impl<W: AsyncWrite + Unpin + Send + 'static> FramedWriter<W> {
    pub fn new(inner: W, max_size: u32) -> Self {
        Self { inner, max_size }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> MessageSink for FramedWriter<W> {
    async fn send(&mut self, msg: &WireMessage) -> Result<(), WireError> {
        write_message(&mut self.inner, msg, self.max_size).await
    }
}

/// Reads length-prefixed JSON frames.
pub struct FramedReader<R> {
    inner: R,
    max_size: u32,
}

impl<R: AsyncRead + Unpin + Send + 'static> FramedReader<R> {
    pub fn new(inner: R, max_size: u32) -> Self {
        Self { inner, max_size }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send + 'static> MessageSource for FramedReader<R> {
    async fn recv(&mut self) -> Result<WireMessage, WireError> {
        read_message(&mut self.inner, self.max_size).await
    }
}

/// An established, not yet handshaked, connection to a peer.
pub struct Connection {
    sink: Box<dyn MessageSink>,
    source: Box<dyn MessageSource>,
    remote_addr: Option<SocketAddr>,
}

impl Connection {
    /// Build a connection from custom halves.
    pub fn new(sink: Box<dyn MessageSink>, source: Box<dyn MessageSource>) -> Self {
        Self {
            sink,
            source,
            remote_addr: None,
        }
    }

    /// Frame messages over any bidirectional byte stream.
    pub fn from_stream<S>(stream: S, max_size: u32) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(
            Box::new(FramedWriter::new(writer, max_size)),
            Box::new(FramedReader::new(reader, max_size)),
        )
    }

    /// Frame messages over a TCP stream.
    pub fn tcp(stream: TcpStream, max_size: u32) -> Self {
        let remote_addr = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        Self {
            sink: Box::new(FramedWriter::new(writer, max_size)),
            source: Box::new(FramedReader::new(reader, max_size)),
            remote_addr,
        }
    }

    /// Two in-process endpoints connected to each other.
    pub fn memory_pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            Self::from_stream(a, DEFAULT_MAX_MESSAGE_SIZE),
            Self::from_stream(b, DEFAULT_MAX_MESSAGE_SIZE),
        )
    }

    /// Socket address of the remote end, when known.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub(crate) fn into_parts(self) -> (Box<dyn MessageSink>, Box<dyn MessageSource>) {
        (self.sink, self.source)
    }
}

/// Write a framed message (4-byte length + JSON).
pub async fn write_message<W>(writer: &mut W, msg: &WireMessage, max_size: u32) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = encode_message(msg)?;
    let len = (bytes.len() - 4) as u32;
    if len > max_size {
        return Err(WireError::MessageTooLarge {
            size: len,
            max: max_size,
        });
    }
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a framed message (4-byte length + JSON).
pub async fn read_message<R>(reader: &mut R, max_size: u32) -> Result<WireMessage, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = decode_length(&header);
    if len > max_size {
        return Err(WireError::MessageTooLarge {
            size: len,
            max: max_size,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;

    // The whole frame was consumed, so a bad body does not desynchronize
    // the stream.
    let value: serde_json::Value = serde_json::from_slice(&body)?;
    WireMessage::deserialize(&value).map_err(|e| WireError::Undecodable {
        id: value.get("id").and_then(serde_json::Value::as_u64),
        frame_type: value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string),
        reason: e.to_string(),
    })
}
