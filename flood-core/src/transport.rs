//! TCP transport: listen, dial, one task per connection, single inbound channel.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use async_trait::async_trait;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::decoder::{DecodeError, Decoder, LengthPrefixedDecoder};
use crate::handshake::{Handshake, NopHandshake};
use crate::peer::{Peer, TcpPeer};
use crate::rpc::Rpc;

/// Inbound channel capacity. A full channel stalls every connection's read loop.
pub const DEFAULT_RPC_BUFFER: usize = 1024;

/// Receives peers once their handshake succeeded, and their departure.
#[async_trait]
pub trait PeerHook: Send + Sync {
    /// Called before any frame from `peer` is read. An error drops the connection.
    async fn admit(&self, peer: Arc<dyn Peer>) -> Result<(), TransportError>;

    /// Called once the connection's read loop has ended.
    async fn disconnected(&self, _peer: &Arc<dyn Peer>) {}
}

/// Anything that moves frames between nodes.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Bound address, once listening.
    fn local_addr(&self) -> Option<SocketAddr>;

    fn set_peer_hook(&self, hook: Arc<dyn PeerHook>);

    async fn listen_and_accept(&self) -> Result<(), TransportError>;

    async fn dial(&self, addr: &str) -> Result<(), TransportError>;

    /// Frames from every peer. Handed out once.
    fn consume(&self) -> Result<mpsc::Receiver<Rpc>, TransportError>;

    /// Stop accepting. Established connections are left running.
    async fn close(&self) -> Result<(), TransportError>;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("transport is already listening")]
    AlreadyListening,
    #[error("inbound channel already consumed")]
    AlreadyConsumed,
    #[error("peer {0} not admitted: {1}")]
    Admission(SocketAddr, String),
}

#[derive(Clone)]
pub struct TcpTransportOptions {
    /// `host:port`; a bare `:port` listens on all interfaces.
    pub listen_addr: String,
    pub handshake: Arc<dyn Handshake>,
    pub decoder: Arc<dyn Decoder>,
    pub rpc_buffer: usize,
}

impl Default for TcpTransportOptions {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".to_string(),
            handshake: Arc::new(NopHandshake),
            decoder: Arc::new(LengthPrefixedDecoder::new()),
            rpc_buffer: DEFAULT_RPC_BUFFER,
        }
    }
}

/// State shared with every connection task.
struct Shared {
    handshake: Arc<dyn Handshake>,
    decoder: Arc<dyn Decoder>,
    hook: OnceLock<Arc<dyn PeerHook>>,
    rpc_tx: mpsc::Sender<Rpc>,
}

pub struct TcpTransport {
    listen_addr: String,
    shared: Arc<Shared>,
    rpc_rx: Mutex<Option<mpsc::Receiver<Rpc>>>,
    local_addr: OnceLock<SocketAddr>,
    shutdown: watch::Sender<bool>,
}

impl TcpTransport {
    pub fn new(opts: TcpTransportOptions) -> Self {
        let (rpc_tx, rpc_rx) = mpsc::channel(opts.rpc_buffer.max(1));
        let (shutdown, _) = watch::channel(false);
        Self {
            listen_addr: opts.listen_addr,
            shared: Arc::new(Shared {
                handshake: opts.handshake,
                decoder: opts.decoder,
                hook: OnceLock::new(),
                rpc_tx,
            }),
            rpc_rx: Mutex::new(Some(rpc_rx)),
            local_addr: OnceLock::new(),
            shutdown,
        }
    }

    pub fn listen_addr(&self) -> &str {
        &self.listen_addr
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    fn set_peer_hook(&self, hook: Arc<dyn PeerHook>) {
        if self.shared.hook.set(hook).is_err() {
            warn!("peer hook already set, ignoring");
        }
    }

    async fn listen_and_accept(&self) -> Result<(), TransportError> {
        let addr = listen_addr(&self.listen_addr);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let bound = listener.local_addr().map_err(|source| TransportError::Bind {
            addr: addr.clone(),
            source,
        })?;
        if self.local_addr.set(bound).is_err() {
            return Err(TransportError::AlreadyListening);
        }
        tokio::spawn(accept_loop(
            listener,
            self.shared.clone(),
            self.shutdown.subscribe(),
        ));
        info!(addr = %bound, "tcp transport listening");
        Ok(())
    }

    async fn dial(&self, addr: &str) -> Result<(), TransportError> {
        let addr = dial_addr(addr);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| TransportError::Dial {
                addr: addr.clone(),
                source,
            })?;
        tokio::spawn(handle_conn(stream, true, self.shared.clone()));
        Ok(())
    }

    fn consume(&self) -> Result<mpsc::Receiver<Rpc>, TransportError> {
        self.rpc_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(TransportError::AlreadyConsumed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shutdown.send_replace(true);
        Ok(())
    }
}

/// `:3000` listens on every interface.
fn listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

/// `:3000` dials the local host.
fn dial_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("127.0.0.1{}", addr)
    } else {
        addr.to_string()
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let closed = *shutdown.borrow();
        if closed {
            break;
        }
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "new incoming connection");
                    tokio::spawn(handle_conn(stream, false, shared.clone()));
                }
                Err(e) => warn!(error = %e, "tcp accept error"),
            },
        }
    }
    info!("tcp transport stopped accepting");
}

/// Connected -> Handshaking -> Admitting -> ReadLoop -> Closed.
async fn handle_conn(mut stream: TcpStream, outbound: bool, shared: Arc<Shared>) {
    let remote_addr = match stream.peer_addr() {
        Ok(addr) => addr,
        Err(e) => {
            warn!(error = %e, "connection without peer address");
            return;
        }
    };

    if let Err(e) = shared.handshake.handshake(&mut stream, outbound).await {
        warn!(peer = %remote_addr, error = %e, "handshake failed, dropping connection");
        return;
    }

    let (mut reader, writer) = stream.into_split();
    let peer: Arc<dyn Peer> = Arc::new(TcpPeer::new(remote_addr, outbound, writer));

    let hook = shared.hook.get().cloned();
    if let Some(hook) = &hook {
        if let Err(e) = hook.admit(peer.clone()).await {
            warn!(peer = %remote_addr, error = %e, "peer not admitted, dropping connection");
            let _ = peer.close().await;
            return;
        }
    }
    debug!(peer = %remote_addr, outbound, "peer admitted");

    read_loop(&mut reader, remote_addr, &shared).await;

    if let Some(hook) = &hook {
        hook.disconnected(&peer).await;
    }
    let _ = peer.close().await;
    info!(peer = %remote_addr, "dropping peer connection");
}

async fn read_loop(reader: &mut OwnedReadHalf, remote_addr: SocketAddr, shared: &Shared) {
    loop {
        let mut rpc = Rpc::new(remote_addr);
        match shared.decoder.decode(reader, &mut rpc).await {
            Ok(()) => {
                rpc.from = remote_addr;
                if shared.rpc_tx.send(rpc).await.is_err() {
                    debug!(peer = %remote_addr, "inbound channel closed");
                    return;
                }
            }
            Err(DecodeError::Closed) => return,
            Err(e) => warn!(peer = %remote_addr, error = %e, "dropping undecodable frame"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::HandshakeError;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::Mutex as AsyncMutex;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut out = (payload.len() as u32).to_le_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[derive(Default)]
    struct Recorder {
        admitted: AsyncMutex<Vec<SocketAddr>>,
        gone: AsyncMutex<Vec<SocketAddr>>,
    }

    #[async_trait]
    impl PeerHook for Recorder {
        async fn admit(&self, peer: Arc<dyn Peer>) -> Result<(), TransportError> {
            self.admitted.lock().await.push(peer.remote_addr());
            Ok(())
        }

        async fn disconnected(&self, peer: &Arc<dyn Peer>) {
            self.gone.lock().await.push(peer.remote_addr());
        }
    }

    struct RejectAll;

    #[async_trait]
    impl Handshake for RejectAll {
        async fn handshake(&self, _: &mut TcpStream, _: bool) -> Result<(), HandshakeError> {
            Err(HandshakeError::Rejected("closed network".into()))
        }
    }

    async fn listening(opts: TcpTransportOptions) -> (TcpTransport, SocketAddr) {
        let tr = TcpTransport::new(opts);
        tr.listen_and_accept().await.unwrap();
        let addr = tr.local_addr().unwrap();
        (tr, addr)
    }

    #[tokio::test]
    async fn listens_on_requested_address() {
        let tr = TcpTransport::new(TcpTransportOptions::default());
        assert_eq!(tr.listen_addr(), "127.0.0.1:0");
        assert!(tr.local_addr().is_none());
        tr.listen_and_accept().await.unwrap();
        assert!(tr.local_addr().is_some());
        assert!(matches!(
            tr.listen_and_accept().await,
            Err(TransportError::AlreadyListening)
        ));
    }

    #[tokio::test]
    async fn frames_reach_consumer_in_order() {
        let (tr, addr) = listening(TcpTransportOptions::default()).await;
        let mut rx = tr.consume().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let local = client.local_addr().unwrap();
        for payload in [&b"one"[..], b"two", b"three"] {
            client.write_all(&frame(payload)).await.unwrap();
        }

        for expected in [&b"one"[..], b"two", b"three"] {
            let rpc = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            assert_eq!(rpc.payload, expected);
            assert_eq!(rpc.from, local);
        }
    }

    #[tokio::test]
    async fn consume_hands_out_receiver_once() {
        let tr = TcpTransport::new(TcpTransportOptions::default());
        assert!(tr.consume().is_ok());
        assert!(matches!(tr.consume(), Err(TransportError::AlreadyConsumed)));
    }

    #[tokio::test]
    async fn decode_fault_does_not_end_read_loop() {
        let (tr, addr) = listening(TcpTransportOptions {
            decoder: Arc::new(LengthPrefixedDecoder::with_max_frame_len(8)),
            ..Default::default()
        })
        .await;
        let mut rx = tr.consume().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&frame(&[0u8; 32])).await.unwrap();
        client.write_all(&frame(b"fine")).await.unwrap();

        let rpc = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(rpc.payload, b"fine");
    }

    /// Fails the first read with an I/O error, then decodes normally.
    #[derive(Default)]
    struct FlakyDecoder {
        failed: AtomicBool,
    }

    #[async_trait]
    impl Decoder for FlakyDecoder {
        async fn decode(
            &self,
            reader: &mut (dyn tokio::io::AsyncRead + Unpin + Send),
            rpc: &mut Rpc,
        ) -> Result<(), DecodeError> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(DecodeError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    "transient read failure",
                )));
            }
            LengthPrefixedDecoder::new().decode(reader, rpc).await
        }
    }

    #[tokio::test]
    async fn read_error_does_not_end_read_loop() {
        let decoder = Arc::new(FlakyDecoder::default());
        let hook = Arc::new(Recorder::default());
        let (tr, addr) = listening(TcpTransportOptions {
            decoder: decoder.clone(),
            ..Default::default()
        })
        .await;
        tr.set_peer_hook(hook.clone());
        let mut rx = tr.consume().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&frame(b"after")).await.unwrap();

        let rpc = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(rpc.payload, b"after");
        assert!(decoder.failed.load(Ordering::SeqCst));
        assert!(hook.gone.lock().await.is_empty());
    }

    #[tokio::test]
    async fn dialed_peers_are_admitted_and_released() {
        let hook_a = Arc::new(Recorder::default());
        let hook_b = Arc::new(Recorder::default());
        let (a, a_addr) = listening(TcpTransportOptions::default()).await;
        a.set_peer_hook(hook_a.clone());
        let b = TcpTransport::new(TcpTransportOptions::default());
        b.set_peer_hook(hook_b.clone());

        b.dial(&a_addr.to_string()).await.unwrap();
        timeout(WAIT, async {
            while hook_a.admitted.lock().await.is_empty() || hook_b.admitted.lock().await.is_empty()
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(hook_b.admitted.lock().await[0], a_addr);
        assert_eq!(hook_a.admitted.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn rejected_handshake_never_admits() {
        let hook = Arc::new(Recorder::default());
        let (tr, addr) = listening(TcpTransportOptions {
            handshake: Arc::new(RejectAll),
            ..Default::default()
        })
        .await;
        tr.set_peer_hook(hook.clone());

        let mut client = TcpStream::connect(addr).await.unwrap();
        let _ = client.write_all(&frame(b"ignored")).await;
        let mut buf = Vec::new();
        // the server drops the connection right after the failed handshake
        let _ = timeout(WAIT, client.read_to_end(&mut buf)).await.unwrap();
        assert!(hook.admitted.lock().await.is_empty());
    }

    #[tokio::test]
    async fn remote_close_reports_disconnect() {
        let hook = Arc::new(Recorder::default());
        let (tr, addr) = listening(TcpTransportOptions::default()).await;
        tr.set_peer_hook(hook.clone());

        let client = TcpStream::connect(addr).await.unwrap();
        let local = client.local_addr().unwrap();
        timeout(WAIT, async {
            while hook.admitted.lock().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        drop(client);
        timeout(WAIT, async {
            while hook.gone.lock().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(hook.gone.lock().await[0], local);
    }

    #[tokio::test]
    async fn close_stops_accepting() {
        let (tr, addr) = listening(TcpTransportOptions::default()).await;
        tr.close().await.unwrap();
        timeout(WAIT, async {
            while TcpStream::connect(addr).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn dial_unreachable_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let tr = TcpTransport::new(TcpTransportOptions::default());
        assert!(matches!(
            tr.dial(&addr.to_string()).await,
            Err(TransportError::Dial { .. })
        ));
    }

    #[test]
    fn bare_port_addresses() {
        assert_eq!(listen_addr(":3000"), "0.0.0.0:3000");
        assert_eq!(dial_addr(":3000"), "127.0.0.1:3000");
        assert_eq!(dial_addr("10.0.0.2:3000"), "10.0.0.2:3000");
    }
}
