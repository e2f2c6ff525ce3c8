//! # TCP Connection Abstraction
//!
//! Provides message framing over TCP streams for client sessions and
//! replication links.
//!
//! ## Wire Protocol
//!
//! Messages are sent with a 4-byte length prefix (big-endian) followed by JSON data:
//! ```text
//! [4 bytes: message length] [N bytes: JSON message data]
//! ```
//!
//! A [`Connection`] can be split into a [`FrameReader`] and a [`FrameWriter`]
//! so one task can block on reads while others push messages out.

use log::error;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Maximum allowed frame size (10MB) to prevent memory exhaustion.
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Why a frame could not be read or written.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The peer announced a frame above [`MAX_MESSAGE_SIZE`]. The stream can
    /// not be resynchronised after this.
    #[error("frame of {0} bytes exceeds the {} byte limit", MAX_MESSAGE_SIZE)]
    TooLarge(usize),

    /// A complete frame arrived but its payload is not a message we know.
    /// The stream is still usable.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read one frame and decode it.
///
/// # Returns
/// - `Ok(Some(msg))`: a message was decoded
/// - `Ok(None)`: the peer closed the stream before the length prefix
/// - `Err`: oversized frame, undecodable payload, or a broken stream
pub async fn read_frame<R, M>(reader: &mut R) -> Result<Option<M>, FrameError>
where
    R: AsyncRead + Unpin,
    M: DeserializeOwned,
{
    let mut length_buf = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut length_buf).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(e.into());
    }

    let length = u32::from_be_bytes(length_buf) as usize;
    if length > MAX_MESSAGE_SIZE {
        error!("❌ Message too large: {} bytes", length);
        return Err(FrameError::TooLarge(length));
    }

    let mut data = vec![0u8; length];
    reader.read_exact(&mut data).await?;

    Ok(Some(serde_json::from_slice(&data)?))
}

/// Encode a message and write it as one frame.
pub async fn write_frame<W, M>(writer: &mut W, message: &M) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let data = serde_json::to_vec(message)?;
    let length = data.len() as u32;

    writer.write_all(&length.to_be_bytes()).await?;
    writer.write_all(&data).await?;
    writer.flush().await?;

    Ok(())
}

/// TCP connection wrapper with message framing support.
pub struct Connection {
    stream: TcpStream,
}

impl Connection {
    /// Create a new Connection from an existing TCP stream.
    ///
    /// # Example
    /// ```ignore
    /// let stream = TcpStream::connect("127.0.0.1:9001").await?;
    /// let mut conn = Connection::new(stream);
    /// ```
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub async fn read_message<M: DeserializeOwned>(&mut self) -> Result<Option<M>, FrameError> {
        read_frame(&mut self.stream).await
    }

    pub async fn write_message<M: Serialize>(&mut self, message: &M) -> Result<(), FrameError> {
        write_frame(&mut self.stream, message).await
    }

    /// Split into independently owned read and write halves.
    pub fn into_split(self) -> (FrameReader<OwnedReadHalf>, FrameWriter<OwnedWriteHalf>) {
        let (read_half, write_half) = self.stream.into_split();
        (FrameReader::new(read_half), FrameWriter::new(write_half))
    }
}

/// Read side of a framed stream.
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub async fn read_message<M: DeserializeOwned>(&mut self) -> Result<Option<M>, FrameError> {
        read_frame(&mut self.inner).await
    }
}

/// Write side of a framed stream.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_message<M: Serialize>(&mut self, message: &M) -> Result<(), FrameError> {
        write_frame(&mut self.inner, message).await
    }
}
