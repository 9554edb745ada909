//! Error types for the relay.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Conditions that end a relay instance.
///
/// Per-connection failures never surface here; they tear down the affected
/// pair and the loop keeps running.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The listening socket could not be set up.
    #[error("bind {addr} failed: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The listening socket failed while accepting.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    /// The run permission was revoked; the loop stopped cooperatively.
    #[error("run permission revoked")]
    PermissionRevoked,
}

impl RelayError {
    /// Whether this is the deliberate stop path rather than a failure.
    pub fn is_stop_request(&self) -> bool {
        matches!(self, RelayError::PermissionRevoked)
    }
}

/// A forward target string that is not `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetParseError {
    #[error("missing port in forward target {0:?}")]
    MissingPort(String),

    #[error("invalid port in forward target {0:?}")]
    InvalidPort(String),

    #[error("empty host in forward target {0:?}")]
    EmptyHost(String),
}
