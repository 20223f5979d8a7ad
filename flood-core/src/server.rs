//! File server: owns the store and the transport, replicates stored files to
//! every connected peer and applies what peers replicate to it.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::peer::{same_peer, Peer};
use crate::protocol::Message;
use crate::rpc::Rpc;
use crate::store::{cas_path_transform, PathTransform, Store, StoreOptions};
use crate::tee::TeeReader;
use crate::transport::{PeerHook, Transport, TransportError};
use crate::wire::{BincodeCodec, CodecError, MessageCodec};

/// Upper bound on one peer's send during a broadcast.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct FileServerOptions {
    pub storage_root: PathBuf,
    pub path_transform: PathTransform,
    /// Dialed on start. Empty entries are skipped.
    pub bootstrap_nodes: Vec<String>,
    pub codec: Arc<dyn MessageCodec>,
    pub send_timeout: Duration,
}

impl Default for FileServerOptions {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from(crate::store::DEFAULT_ROOT),
            path_transform: Arc::new(cas_path_transform),
            bootstrap_nodes: Vec::new(),
            codec: Arc::new(BincodeCodec),
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("store: {0}")]
    Store(#[from] io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("broadcast failed for all {failed} peers")]
    BroadcastFailed { failed: usize },
    #[error("file server already started")]
    AlreadyStarted,
}

/// Lifecycle of a file server. There is no way back to `Started`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Started,
    Stopping,
    Stopped,
}

/// Live peers keyed by remote address.
#[derive(Default)]
pub struct PeerRegistry {
    peers: AsyncMutex<HashMap<SocketAddr, Arc<dyn Peer>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `peer`, replacing any entry for the same address.
    pub async fn insert(&self, peer: Arc<dyn Peer>) {
        self.peers.lock().await.insert(peer.remote_addr(), peer);
    }

    /// Remove `peer` if it is still the entry for its address.
    pub async fn remove(&self, peer: &Arc<dyn Peer>) -> bool {
        let mut peers = self.peers.lock().await;
        let addr = peer.remote_addr();
        match peers.get(&addr) {
            Some(current) if same_peer(current, peer) => {
                peers.remove(&addr);
                true
            }
            _ => false,
        }
    }

    pub async fn snapshot(&self) -> Vec<Arc<dyn Peer>> {
        self.peers.lock().await.values().cloned().collect()
    }

    pub async fn addrs(&self) -> Vec<SocketAddr> {
        self.peers.lock().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl PeerHook for PeerRegistry {
    async fn admit(&self, peer: Arc<dyn Peer>) -> Result<(), TransportError> {
        let addr = peer.remote_addr();
        let outbound = peer.is_outbound();
        self.insert(peer).await;
        info!(peer = %addr, outbound, "connected with remote");
        Ok(())
    }

    async fn disconnected(&self, peer: &Arc<dyn Peer>) {
        if self.remove(peer).await {
            info!(peer = %peer.remote_addr(), "peer removed");
        }
    }
}

pub struct FileServer<T: Transport> {
    bootstrap_nodes: Vec<String>,
    codec: Arc<dyn MessageCodec>,
    send_timeout: Duration,
    transport: Arc<T>,
    peers: Arc<PeerRegistry>,
    store: Store,
    state: Mutex<ServerState>,
    quit: watch::Sender<bool>,
    /// Inbound receiver kept after the loop exits, so connection handlers
    /// block on a full channel instead of seeing it closed.
    parked: Mutex<Option<mpsc::Receiver<Rpc>>>,
}

impl<T: Transport> FileServer<T> {
    /// Build a server around `transport` and install its peer registry as
    /// the transport's admission hook.
    pub fn new(opts: FileServerOptions, transport: T) -> Self {
        let store = Store::new(StoreOptions {
            root: opts.storage_root,
            path_transform: opts.path_transform,
        });
        let transport = Arc::new(transport);
        let peers = Arc::new(PeerRegistry::new());
        transport.set_peer_hook(peers.clone());
        let (quit, _) = watch::channel(false);
        Self {
            bootstrap_nodes: opts.bootstrap_nodes,
            codec: opts.codec,
            send_timeout: opts.send_timeout,
            transport,
            peers,
            store,
            state: Mutex::new(ServerState::Created),
            quit,
            parked: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn peers(&self) -> &Arc<PeerRegistry> {
        &self.peers
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.len().await
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ServerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Listen, dial the bootstrap nodes and run the event loop until `stop`.
    pub async fn start(&self) -> Result<(), ServerError> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != ServerState::Created {
                return Err(ServerError::AlreadyStarted);
            }
            *state = ServerState::Started;
        }

        if let Err(e) = self.transport.listen_and_accept().await {
            self.set_state(ServerState::Stopped);
            return Err(e.into());
        }
        self.bootstrap_network();
        self.run().await
    }

    /// Signal the event loop to exit. Single-shot.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == ServerState::Started {
                *state = ServerState::Stopping;
            }
        }
        self.quit.send_replace(true);
    }

    /// Dial every bootstrap node on its own task. Failures are logged only.
    fn bootstrap_network(&self) {
        for addr in &self.bootstrap_nodes {
            let addr = addr.trim();
            if addr.is_empty() {
                continue;
            }
            let addr = addr.to_string();
            let transport = self.transport.clone();
            tokio::spawn(async move {
                debug!(addr = %addr, "dialing bootstrap node");
                if let Err(e) = transport.dial(&addr).await {
                    error!(addr = %addr, error = %e, "dial error");
                }
            });
        }
    }

    async fn run(&self) -> Result<(), ServerError> {
        let rpcs = self.transport.consume();
        let result = match rpcs {
            Ok(mut rpcs) => {
                let mut quit = self.quit.subscribe();
                loop {
                    let quitting = *quit.borrow();
                    if quitting {
                        break;
                    }
                    tokio::select! {
                        _ = quit.changed() => break,
                        rpc = rpcs.recv() => match rpc {
                            Some(rpc) => self.handle_rpc(rpc).await,
                            None => break,
                        },
                    }
                }
                *self.parked.lock().unwrap_or_else(PoisonError::into_inner) = Some(rpcs);
                info!("file server stopped due to user quit action");
                Ok(())
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = self.transport.close().await {
            warn!(error = %e, "closing transport");
        }
        self.set_state(ServerState::Stopped);
        result
    }

    async fn handle_rpc(&self, rpc: Rpc) {
        let msg = match self.codec.decode(&rpc.payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(from = %rpc.from, error = %e, "dropping undecodable message");
                return;
            }
        };
        match msg {
            Message::StoreFile { key, data } => {
                match self.store.write(&key, data.as_slice()).await {
                    Ok(n) => info!(from = %rpc.from, key = %key, bytes = n, "stored replicated file"),
                    Err(e) => error!(from = %rpc.from, key = %key, error = %e, "storing replicated file"),
                }
            }
            Message::Control(control) => {
                debug!(from = %rpc.from, ?control, "control message");
            }
        }
    }

    /// Persist `reader` under `key`, then replicate the same bytes to every
    /// peer. Only local persistence and encoding errors are returned; on an
    /// encoding error the local copy stays on disk.
    pub async fn store_data<R>(&self, key: &str, reader: R) -> Result<(), ServerError>
    where
        R: AsyncRead + Unpin,
    {
        let mut tee = TeeReader::new(reader);
        let written = self.store.write(key, &mut tee).await?;
        let data = tee.into_captured();
        debug_assert_eq!(written, data.len() as u64);

        let msg = Message::store_file(key, data);
        match self.broadcast(&msg).await {
            Ok(reached) => {
                debug!(key, bytes = written, peers = reached, "stored and replicated");
                Ok(())
            }
            Err(ServerError::BroadcastFailed { failed }) => {
                warn!(key, failed, "replication failed for every peer");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Encode `msg` once and send it to every registered peer concurrently.
    /// Peers that fail are evicted. Returns how many peers got the message;
    /// fails only if encoding fails or every peer failed.
    pub async fn broadcast(&self, msg: &Message) -> Result<usize, ServerError> {
        let frame: Arc<[u8]> = self.codec.encode(msg)?.into();
        let peers = self.peers.snapshot().await;
        if peers.is_empty() {
            debug!(kind = msg.kind(), "no peers to broadcast to");
            return Ok(0);
        }

        let mut sends = JoinSet::new();
        for peer in peers {
            let frame = frame.clone();
            let send_timeout = self.send_timeout;
            sends.spawn(async move {
                let result = match tokio::time::timeout(send_timeout, peer.send(&frame)).await {
                    Ok(result) => result,
                    Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "send timed out")),
                };
                (peer, result)
            });
        }

        let total = sends.len();
        let mut reached = 0;
        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok((_, Ok(()))) => reached += 1,
                Ok((peer, Err(e))) => {
                    warn!(peer = %peer.remote_addr(), error = %e, "broadcast to peer failed");
                    self.peers.remove(&peer).await;
                    let _ = peer.close().await;
                }
                Err(e) => warn!(error = %e, "broadcast task failed"),
            }
        }

        if reached == 0 {
            return Err(ServerError::BroadcastFailed { failed: total });
        }
        Ok(reached)
    }
}
