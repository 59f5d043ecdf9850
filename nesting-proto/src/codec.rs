//! Length-prefixed framing for protobuf messages.
//!
//! A Unix stream socket has no message boundaries, so every message is
//! preceded by its encoded length:
//!
//! ```text
//! ┌──────────────────┬───────────────────────────────────────────┐
//! │  4 bytes (BE)    │          N bytes                          │
//! │  Message Length  │          Protobuf Payload                 │
//! └──────────────────┴───────────────────────────────────────────┘
//! ```

use prost::Message;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::trace;

/// Maximum message size (4 MiB)
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Errors raised while reading or writing a frame.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Message too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Failed to decode message: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// Read a length-prefixed protobuf message from the stream.
///
/// Returns `Ok(Some(message))` on success, `Ok(None)` if the peer closed the
/// stream cleanly before a new frame started.
pub async fn read_message<R, M>(reader: &mut R) -> Result<Option<M>, FrameError>
where
    R: AsyncReadExt + Unpin,
    M: Message + Default,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    let message = M::decode(&payload[..])?;
    trace!(length = len, "Message received");
    Ok(Some(message))
}

/// Write a length-prefixed protobuf message to the stream and flush it.
pub async fn write_message<W, M>(writer: &mut W, message: &M) -> Result<(), FrameError>
where
    W: AsyncWriteExt + Unpin,
    M: Message,
{
    let payload = message.encode_to_vec();
    let len = payload.len();
    if len > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    writer.write_all(&(len as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;

    trace!(length = len, "Message written");
    Ok(())
}
