//! Backend connections.
//!
//! Every authorized client gets a fresh connection to the instance's fixed
//! forward target. There is no pooling or reuse: the backend socket lives and
//! dies with its client.

use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::TargetParseError;

/// Default connect timeout for backend connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Fixed `(host, port)` a relay instance forwards to.
///
/// The host may be an IPv4 literal, an IPv6 literal (bracketed in the string
/// form), or a name resolved at connect time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForwardTarget {
    pub host: String,
    pub port: u16,
}

impl ForwardTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Whether the host is an IPv6 literal.
    pub fn is_ipv6(&self) -> bool {
        self.host.contains(':')
    }
}

impl FromStr for ForwardTarget {
    type Err = TargetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let (host, port) = raw
            .rsplit_once(':')
            .ok_or_else(|| TargetParseError::MissingPort(raw.to_string()))?;

        let host = match host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
            Some(v6) => v6,
            // An unbracketed IPv6 literal cannot be told apart from its port.
            None if host.contains(':') => {
                return Err(TargetParseError::MissingPort(raw.to_string()))
            }
            None => host,
        };

        if host.is_empty() {
            return Err(TargetParseError::EmptyHost(raw.to_string()));
        }

        let port = port
            .parse::<u16>()
            .map_err(|_| TargetParseError::InvalidPort(raw.to_string()))?;

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for ForwardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ipv6() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Opens outbound connections to one forward target.
#[derive(Debug, Clone)]
pub struct BackendConnector {
    target: ForwardTarget,
    connect_timeout: Duration,
}

impl BackendConnector {
    pub fn new(target: ForwardTarget) -> Self {
        Self::with_timeout(target, DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_timeout(target: ForwardTarget, connect_timeout: Duration) -> Self {
        Self {
            target,
            connect_timeout,
        }
    }

    /// Connect to the target, bounded by the connect timeout.
    pub async fn connect(&self) -> io::Result<TcpStream> {
        debug!(target_addr = %self.target, "Connecting to backend");

        let connect = TcpStream::connect((self.target.host.as_str(), self.target.port));
        match timeout(self.connect_timeout, connect).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
        }
    }
}
