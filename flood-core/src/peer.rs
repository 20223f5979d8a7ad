//! A remote node over an established connection.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;

/// Send side of one connection. The read side stays with the transport's
/// connection task.
#[async_trait]
pub trait Peer: Send + Sync {
    fn remote_addr(&self) -> SocketAddr;

    /// True if this side dialed the connection.
    fn is_outbound(&self) -> bool;

    /// Write all of `bytes`. A partial write is an error.
    async fn send(&self, bytes: &[u8]) -> io::Result<()>;

    /// Shut down the write side; the remote sees end of stream.
    async fn close(&self) -> io::Result<()>;
}

/// Identity comparison for peers held as trait objects.
pub fn same_peer(a: &Arc<dyn Peer>, b: &Arc<dyn Peer>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Peer over a TCP connection.
pub struct TcpPeer {
    remote_addr: SocketAddr,
    // dialed => outbound = true, accepted => outbound = false
    outbound: bool,
    writer: Mutex<OwnedWriteHalf>,
}

impl TcpPeer {
    pub fn new(remote_addr: SocketAddr, outbound: bool, writer: OwnedWriteHalf) -> Self {
        Self {
            remote_addr,
            outbound,
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl Peer for TcpPeer {
    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn is_outbound(&self) -> bool {
        self.outbound
    }

    async fn send(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    async fn close(&self) -> io::Result<()> {
        match self.writer.lock().await.shutdown().await {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}
