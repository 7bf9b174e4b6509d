//! IPC frame codec
//!
//! IPC messages are serialized using postcard (compact binary format) and
//! framed with a length prefix over the helper's Unix socket.
//!
//! # Frame Format
//!
//! ```text
//! [Length: u32 (big-endian)][Message bytes (postcard serialized)]
//! ```
//!
//! Maximum frame size is 1 MiB to bound what a misbehaving peer can make
//! either side allocate.

use crate::error::ProtocolError;
use serde::{Serialize, de::DeserializeOwned};

#[cfg(feature = "async")]
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Maximum allowed frame body size (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

pub type FrameResult<T> = std::result::Result<T, ProtocolError>;

/// Encode a message with length prefix for framing
///
/// # Example
/// ```
/// use protocol::{IpcCommand, IpcRequest, encode_frame, decode_frame};
///
/// let request = IpcRequest::new(IpcCommand::HealthCheck, "usbipd");
/// let framed = encode_frame(&request).unwrap();
/// let decoded: IpcRequest = decode_frame(&framed).unwrap();
/// assert_eq!(decoded.command, IpcCommand::HealthCheck);
/// ```
pub fn encode_frame<T: Serialize>(message: &T) -> FrameResult<Vec<u8>> {
    let body = postcard::to_allocvec(message)?;

    if body.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a complete frame (length prefix included)
pub fn decode_frame<T: DeserializeOwned>(frame: &[u8]) -> FrameResult<T> {
    if frame.len() < 4 {
        return Err(ProtocolError::IncompleteFrame {
            expected: 4,
            actual: frame.len(),
        });
    }

    let length = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: length,
            max: MAX_FRAME_SIZE,
        });
    }
    if frame.len() < 4 + length {
        return Err(ProtocolError::IncompleteFrame {
            expected: 4 + length,
            actual: frame.len(),
        });
    }

    Ok(postcard::from_bytes(&frame[4..4 + length])?)
}

/// Async: encode and write one framed message
#[cfg(feature = "async")]
pub async fn write_frame_async<W, T>(writer: &mut W, message: &T) -> FrameResult<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let framed = encode_frame(message)?;
    writer.write_all(&framed).await?;
    writer.flush().await?;
    Ok(())
}

/// Async: read and decode one framed message
///
/// Returns `Ok(None)` when the peer closed the stream before a new frame.
#[cfg(feature = "async")]
pub async fn read_frame_async<R, T>(reader: &mut R) -> FrameResult<Option<T>>
where
    R: AsyncReadExt + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let length = u32::from_be_bytes(len_bytes) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: length,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    Ok(Some(postcard::from_bytes(&body)?))
}
