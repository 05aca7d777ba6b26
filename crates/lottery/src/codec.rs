// Length-delimited message framing for the agency protocol.
//
// Every message is a 2-byte big-endian length followed by that many payload
// bytes. The codec is payload-agnostic; `protocol` decides what the bytes
// mean. Partial reads and writes are retried until the frame is complete
// (`read_exact` / `write_all`), and a stream that ends mid-frame surfaces as
// `FrameError::ConnectionClosed` with no attempt at recovery.

use bytes::{BufMut, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Largest payload a single frame can carry.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("payload of {0} bytes does not fit in a frame (max 65535)")]
    PayloadTooLarge(usize),
    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("IO error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for FrameError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::WriteZero => FrameError::ConnectionClosed,
            _ => FrameError::Io(err),
        }
    }
}

/// Write one frame: length prefix, then the payload, then flush.
pub async fn send_message<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let len = payload.len();
    if len > MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge(len));
    }

    let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + len);
    frame.put_u16(len as u16);
    frame.put_slice(payload);

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame and return its payload.
pub async fn receive_message<R>(reader: &mut R) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    reader.read_exact(&mut prefix).await?;
    let len = u16::from_be_bytes(prefix) as usize;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

pub async fn send_text<W>(writer: &mut W, text: &str) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    send_message(writer, text.as_bytes()).await
}

pub async fn receive_text<R>(reader: &mut R) -> Result<String, FrameError>
where
    R: AsyncRead + Unpin,
{
    let payload = receive_message(reader).await?;
    Ok(String::from_utf8(payload)?)
}
