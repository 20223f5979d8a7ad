//! Handshake gate run on every new connection before any frame is read.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol::PROTOCOL_VERSION;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Decides whether a freshly connected stream may become a peer.
/// `outbound` is true when this side dialed.
#[async_trait]
pub trait Handshake: Send + Sync {
    async fn handshake(&self, stream: &mut TcpStream, outbound: bool)
        -> Result<(), HandshakeError>;
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake io: {0}")]
    Io(#[from] io::Error),
    #[error("unsupported protocol version {0}")]
    VersionMismatch(u8),
    #[error("handshake timed out")]
    Timeout,
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Admits every connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopHandshake;

#[async_trait]
impl Handshake for NopHandshake {
    async fn handshake(&self, _: &mut TcpStream, _: bool) -> Result<(), HandshakeError> {
        Ok(())
    }
}

/// Exchanges a one-byte protocol version. The dialer speaks first; the
/// acceptor answers only if the version matches.
#[derive(Debug, Clone, Copy)]
pub struct VersionHandshake {
    version: u8,
}

impl VersionHandshake {
    pub fn new() -> Self {
        Self::with_version(PROTOCOL_VERSION)
    }

    pub fn with_version(version: u8) -> Self {
        Self { version }
    }

    async fn exchange(&self, stream: &mut TcpStream, outbound: bool) -> Result<(), HandshakeError> {
        let mut buf = [0u8; 1];
        if outbound {
            stream.write_all(&[self.version]).await?;
            stream.flush().await?;
            stream.read_exact(&mut buf).await?;
            if buf[0] != self.version {
                return Err(HandshakeError::VersionMismatch(buf[0]));
            }
        } else {
            stream.read_exact(&mut buf).await?;
            if buf[0] != self.version {
                return Err(HandshakeError::VersionMismatch(buf[0]));
            }
            stream.write_all(&[self.version]).await?;
            stream.flush().await?;
        }
        Ok(())
    }
}

impl Default for VersionHandshake {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handshake for VersionHandshake {
    async fn handshake(&self, stream: &mut TcpStream, outbound: bool) -> Result<(), HandshakeError> {
        tokio::time::timeout(HANDSHAKE_TIMEOUT, self.exchange(stream, outbound))
            .await
            .map_err(|_| HandshakeError::Timeout)?
    }
}
