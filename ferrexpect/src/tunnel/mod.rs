//! Port forwarding over the session's SSH connection.
//!
//! Three kinds of tunnel are supported:
//!
//! - **local**: a local listener, each connection carried to a fixed remote target
//! - **remote**: a listener on the server, each connection delivered to a fixed local target
//! - **dynamic**: a local SOCKS4/4a/5 proxy
//!
//! Each tunnel runs as its own tokio task with a cancellation token, and is
//! registered in a [`TunnelManager`] under a structured [`TunnelKey`].

mod bridge;
mod dynamic;
mod local;
mod manager;
mod remote;
pub mod socks;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TunnelError;

pub use bridge::BridgeStats;
pub use manager::TunnelManager;

/// Tunnel settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Local address listeners bind to unless a call overrides it.
    pub bind_addr: IpAddr,

    /// Address the server binds remote forwards to.
    pub remote_bind_addr: String,

    /// How long to wait for a cancelled worker before aborting it.
    pub join_timeout: Duration,

    /// Deadline for a SOCKS client to finish its handshake.
    pub handshake_timeout: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            remote_bind_addr: "localhost".to_string(),
            join_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelKind {
    Local,
    Remote,
    Dynamic,
}

/// Identity of a tunnel: requesting the same key twice yields the same tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TunnelKey {
    Local {
        local_port: u16,
        remote_host: String,
        remote_port: u16,
    },
    Remote {
        remote_port: u16,
        local_host: String,
        local_port: u16,
    },
    Dynamic {
        local_port: u16,
    },
}

impl TunnelKey {
    pub fn kind(&self) -> TunnelKind {
        match self {
            TunnelKey::Local { .. } => TunnelKind::Local,
            TunnelKey::Remote { .. } => TunnelKind::Remote,
            TunnelKey::Dynamic { .. } => TunnelKind::Dynamic,
        }
    }
}

impl fmt::Display for TunnelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelKey::Local {
                local_port,
                remote_host,
                remote_port,
            } => write!(f, "L {local_port}:{remote_host}:{remote_port}"),
            TunnelKey::Remote {
                remote_port,
                local_host,
                local_port,
            } => write!(f, "R {remote_port}:{local_host}:{local_port}"),
            TunnelKey::Dynamic { local_port } => write!(f, "D {local_port}"),
        }
    }
}

/// A running tunnel, as returned by the `forward_*` methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelHandle {
    id: u64,
    key: TunnelKey,
    bound_port: u16,
    local_addr: Option<SocketAddr>,
}

impl TunnelHandle {
    pub(crate) fn new(id: u64, key: TunnelKey, bound_port: u16, local_addr: Option<SocketAddr>) -> Self {
        Self {
            id,
            key,
            bound_port,
            local_addr,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &TunnelKey {
        &self.key
    }

    pub fn kind(&self) -> TunnelKind {
        self.key.kind()
    }

    /// Port actually listened on: local for local and dynamic tunnels, on the
    /// server for remote ones.
    pub fn bound_port(&self) -> u16 {
        self.bound_port
    }

    /// Local listening address, for local and dynamic tunnels.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

/// Result of stopping every tunnel.
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// Tunnels that stopped within the join timeout.
    pub closed: usize,
    /// Tunnels that had to be aborted or whose worker failed.
    pub failures: Vec<(TunnelKey, TunnelError)>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}
