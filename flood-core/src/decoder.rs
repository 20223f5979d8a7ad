//! Reads one frame at a time off a peer's stream.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::rpc::Rpc;
use crate::wire::{LEN_SIZE, MAX_FRAME_LEN};

/// Consumes exactly one framed message from `reader` and fills `rpc.payload`.
#[async_trait]
pub trait Decoder: Send + Sync {
    async fn decode(
        &self,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        rpc: &mut Rpc,
    ) -> Result<(), DecodeError>;
}

/// Error decoding a frame. `Closed` ends the connection; everything else
/// only costs the current frame.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("connection closed")]
    Closed,
    #[error("frame too large ({len} bytes, max {max})")]
    TooLarge { len: usize, max: usize },
    #[error("read error: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for DecodeError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected => DecodeError::Closed,
            _ => DecodeError::Io(e),
        }
    }
}

/// 4-byte little-endian length followed by that many payload bytes.
/// Oversized frames are drained and reported, leaving the stream aligned
/// on the next frame.
#[derive(Debug, Clone, Copy)]
pub struct LengthPrefixedDecoder {
    max_frame_len: usize,
}

impl LengthPrefixedDecoder {
    pub fn new() -> Self {
        Self::with_max_frame_len(MAX_FRAME_LEN as usize)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Default for LengthPrefixedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Decoder for LengthPrefixedDecoder {
    async fn decode(
        &self,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        rpc: &mut Rpc,
    ) -> Result<(), DecodeError> {
        let mut len_buf = [0u8; LEN_SIZE];
        reader.read_exact(&mut len_buf).await?;
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > self.max_frame_len {
            let mut rest = (&mut *reader).take(len as u64);
            let drained = tokio::io::copy(&mut rest, &mut tokio::io::sink()).await?;
            if drained < len as u64 {
                return Err(DecodeError::Closed);
            }
            return Err(DecodeError::TooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        rpc.payload = payload;
        Ok(())
    }
}
