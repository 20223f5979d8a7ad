//! Transport-level unit handed to the file server.

use std::net::SocketAddr;

/// One decoded frame's raw bytes and the address of the peer that sent it.
/// The payload is not interpreted by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rpc {
    pub from: SocketAddr,
    pub payload: Vec<u8>,
}

impl Rpc {
    pub fn new(from: SocketAddr) -> Self {
        Self {
            from,
            payload: Vec::new(),
        }
    }
}
