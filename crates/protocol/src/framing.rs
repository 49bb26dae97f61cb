//! Length-delimited message framing for the control and plugin channels.
//!
//! Each frame is a `u32` big-endian payload length followed by the protobuf
//! bytes. Frames above [`MAX_FRAME_SIZE`] are rejected before any allocation
//! so a hostile peer cannot make the server reserve arbitrary memory.

use prost::Message;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for a single control frame.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    FrameTooLarge(usize),

    #[error("decode failed: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// Write one length-prefixed message and flush.
pub async fn write_message<W, M>(writer: &mut W, message: &M) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
    M: Message,
{
    let bytes = message.encode_to_vec();
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(bytes.len()));
    }

    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed message.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly, i.e.
/// EOF on a frame boundary. EOF inside a frame is an error.
pub async fn read_message<R, M>(reader: &mut R) -> Result<Option<M>, CodecError>
where
    R: AsyncRead + Unpin,
    M: Message + Default,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(len));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;

    Ok(Some(M::decode(buf.as_slice())?))
}
