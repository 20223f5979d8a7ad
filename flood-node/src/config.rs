//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Node configuration. File: `--config PATH`, else ~/.config/floodstore/config.toml
/// or /etc/floodstore/config.toml.
/// Env overrides: FLOOD_LISTEN_ADDR, FLOOD_STORAGE_ROOT, FLOOD_BOOTSTRAP, FLOOD_RPC_BUFFER.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Transport listen address (default ":3000").
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Store root. Derived from the listen address when unset.
    #[serde(default)]
    pub storage_root: Option<PathBuf>,
    /// Peers dialed on start.
    #[serde(default)]
    pub bootstrap_nodes: Vec<String>,
    /// Inbound frame buffer (default 1024).
    #[serde(default = "default_rpc_buffer")]
    pub rpc_buffer: usize,
    /// Per-peer broadcast send timeout in seconds (default 10).
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    #[serde(default)]
    pub handshake: HandshakeKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandshakeKind {
    #[default]
    None,
    Version,
}

fn default_listen_addr() -> String {
    ":3000".to_string()
}
fn default_rpc_buffer() -> usize {
    flood_core::transport::DEFAULT_RPC_BUFFER
}
fn default_send_timeout_secs() -> u64 {
    flood_core::server::DEFAULT_SEND_TIMEOUT.as_secs()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            storage_root: None,
            bootstrap_nodes: Vec::new(),
            rpc_buffer: default_rpc_buffer(),
            send_timeout_secs: default_send_timeout_secs(),
            handshake: HandshakeKind::default(),
        }
    }
}

impl Config {
    /// `:3000` -> `_3000_network`, `127.0.0.1:4000` -> `127.0.0.1_4000_network`.
    pub fn storage_root(&self) -> PathBuf {
        match &self.storage_root {
            Some(root) => root.clone(),
            None => PathBuf::from(format!("{}_network", self.listen_addr.replace(':', "_"))),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => parse_file(path)?,
        None => load_file().unwrap_or_default(),
    };
    apply_env(&mut c, |name| std::env::var(name).ok());
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("FLOOD_LISTEN_ADDR") {
        c.listen_addr = s;
    }
    if let Some(s) = var("FLOOD_STORAGE_ROOT") {
        c.storage_root = Some(PathBuf::from(s));
    }
    if let Some(s) = var("FLOOD_BOOTSTRAP") {
        c.bootstrap_nodes = s
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(String::from)
            .collect();
    }
    if let Some(s) = var("FLOOD_RPC_BUFFER") {
        if let Ok(n) = s.parse::<usize>() {
            c.rpc_buffer = n;
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/floodstore/config.toml"));
    }
    out.push(PathBuf::from("/etc/floodstore/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}

fn parse_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&s)?)
}
