//! Peer-to-peer file store: content-addressed local storage, TCP transport,
//! and a file server that floods every stored file to its connected peers.

pub mod decoder;
pub mod handshake;
pub mod peer;
pub mod protocol;
pub mod rpc;
pub mod server;
pub mod store;
pub mod tee;
pub mod transport;
pub mod wire;

pub use decoder::{DecodeError, Decoder, LengthPrefixedDecoder};
pub use handshake::{Handshake, HandshakeError, NopHandshake, VersionHandshake};
pub use peer::{Peer, TcpPeer};
pub use protocol::{Control, Message, PROTOCOL_VERSION};
pub use rpc::Rpc;
pub use server::{FileServer, FileServerOptions, PeerRegistry, ServerError, ServerState};
pub use store::{
    cas_path_transform, identity_path_transform, sha256_path_transform, PathKey, PathTransform,
    Store, StoreOptions,
};
pub use transport::{PeerHook, TcpTransport, TcpTransportOptions, Transport, TransportError};
pub use wire::{encode_frame, BincodeCodec, CodecError, MessageCodec};
