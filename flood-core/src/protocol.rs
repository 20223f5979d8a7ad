//! File-server wire protocol: message envelope and version.

use serde::{Deserialize, Serialize};

/// Current protocol version. Exchanged by the version handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// All messages exchanged between file servers. Encoding is bincode; framing is
/// length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Signal carrying no stored data.
    Control(Control),
    /// A file stored on the sender, to be persisted by every receiver.
    StoreFile { key: String, data: Vec<u8> },
}

/// Control signals. Receivers currently ignore them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Control {
    /// Liveness probe.
    Ping,
}

impl Message {
    pub fn store_file(key: impl Into<String>, data: Vec<u8>) -> Self {
        Message::StoreFile {
            key: key.into(),
            data,
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Control(_) => "control",
            Message::StoreFile { .. } => "store_file",
        }
    }
}
