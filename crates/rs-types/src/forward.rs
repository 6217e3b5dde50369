//! Port forwarding specifications shared by configuration loaders and the runtime.

use serde::{Deserialize, Serialize};

/// Direction of a forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ForwardKind {
    /// Listen locally, proxy each connection to a target reached through the peer.
    Local,
    /// Ask the peer to listen, proxy each connection to a local target.
    Remote,
}

impl std::fmt::Display for ForwardKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForwardKind::Local => f.write_str("local"),
            ForwardKind::Remote => f.write_str("remote"),
        }
    }
}

/// Local forward specification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalForwardSpec {
    /// Optional local bind address (defaults to loopback).
    pub bind_address: Option<String>,
    /// Local bind port; 0 picks an ephemeral port.
    pub bind_port: u16,
    /// Target host to reach through the peer.
    pub target_host: String,
    /// Target port to reach through the peer.
    pub target_port: u16,
}

impl LocalForwardSpec {
    pub fn new(bind_port: u16, target_host: impl Into<String>, target_port: u16) -> Self {
        Self {
            bind_address: None,
            bind_port,
            target_host: target_host.into(),
            target_port,
        }
    }

    pub fn bind_host(&self) -> &str {
        self.bind_address.as_deref().unwrap_or("127.0.0.1")
    }
}

/// Remote forward specification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteForwardSpec {
    /// Optional bind address requested on the peer.
    pub bind_address: Option<String>,
    /// Port requested on the peer; 0 lets the peer choose.
    pub bind_port: u16,
    /// Local target host receiving connections.
    pub target_host: String,
    /// Local target port receiving connections.
    pub target_port: u16,
}

impl RemoteForwardSpec {
    pub fn new(bind_port: u16, target_host: impl Into<String>, target_port: u16) -> Self {
        Self {
            bind_address: None,
            bind_port,
            target_host: target_host.into(),
            target_port,
        }
    }
}
