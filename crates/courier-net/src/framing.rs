//! Length-prefixed framing for relay streams.
//!
//! Every message on the wire is one frame:
//!
//! ```text
//! +-------------------+----------------------------------+
//! | length (4 bytes)  |   body (length bytes)            |
//! | u32 little-endian |   [tag][sender_uid][fields...]   |
//! +-------------------+----------------------------------+
//! ```
//!
//! The length does not include the prefix itself. Frame bodies are produced
//! and parsed by [`crate::codec`]; [`read_message`] and [`write_message`]
//! combine both layers.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::codec::{self, DecodeError, EncodeError};
use crate::messages::Message;

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed body size in bytes. Default: 1 MB.
    pub max_payload_size: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 1_048_576,
        }
    }
}

/// Errors that can occur while moving frames over a stream.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The body size exceeds the configured maximum.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The actual body size.
        size: u32,
        /// The configured maximum.
        max: u32,
    },

    /// The connection was closed before a complete frame was received.
    #[error("connection closed")]
    ConnectionClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A complete frame arrived but its body did not decode.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The outgoing message could not be encoded.
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

impl FrameError {
    /// Whether the stream is still usable after this error.
    ///
    /// A malformed body consumed exactly one frame, so the next read starts
    /// on a frame boundary. An unknown tag is treated as a protocol mismatch.
    pub fn is_recoverable(&self) -> bool {
        match self {
            FrameError::Decode(e) => !e.is_protocol_violation(),
            _ => false,
        }
    }
}

fn closed_or_io(e: std::io::Error) -> FrameError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::ConnectionClosed
    } else {
        FrameError::Io(e)
    }
}

/// Read a single length-prefixed frame from the stream.
///
/// Returns the body bytes. Returns [`FrameError::ConnectionClosed`] if the
/// peer closes the connection before the frame is complete.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Vec<u8>, FrameError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(closed_or_io)?;

    let payload_len = u32::from_le_bytes(len_buf);
    if payload_len > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: config.max_payload_size,
        });
    }

    let mut payload = vec![0u8; payload_len as usize];
    if payload_len > 0 {
        reader.read_exact(&mut payload).await.map_err(closed_or_io)?;
    }

    Ok(payload)
}

/// Write a single length-prefixed frame to the stream.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
    config: &FrameConfig,
) -> Result<(), FrameError> {
    let len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    if len > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size: len,
            max: config.max_payload_size,
        });
    }

    writer.write_all(&len.to_le_bytes()).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;

    Ok(())
}

/// Read and decode one message.
pub async fn read_message<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Message, FrameError> {
    let body = read_frame(reader, config).await?;
    Ok(codec::decode(&body)?)
}

/// Encode and write one message.
pub async fn write_message<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    message: &Message,
    config: &FrameConfig,
) -> Result<(), FrameError> {
    let body = codec::encode(message)?;
    write_frame(writer, &body, config).await
}
