//! Client authorization.
//!
//! An [`Authorizer`] decides whether a freshly accepted client may be relayed,
//! before any backend connection is opened. Relays with authentication
//! disabled never call it.
//!
//! [`CredentialCheck`] is a reference scheme only: it expects an HTTP-style
//! request line whose path carries `uname=<user>&upass=<password>`, compared
//! in cleartext against one configured pair. It is not a security boundary.
//! Bytes it reads are consumed and never reach the backend.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Default time to wait for the credential payload.
pub const DEFAULT_AUTH_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Maximum bytes read when looking for credentials.
pub const DEFAULT_AUTH_MAX_BYTES: usize = 4096;

const USER_FIELD: &str = "uname=";
const PASSWORD_FIELD: &str = "upass=";
const PASSWORD_DELIMITER: &str = "&upass=";

/// Capability deciding whether a client may be relayed.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Inspect the start of the client stream and decide.
    ///
    /// Any bytes read are consumed.
    async fn authorize(
        &self,
        client: &mut (dyn AsyncRead + Unpin + Send),
        peer_addr: SocketAddr,
    ) -> bool;
}

/// Authorizes every client without reading from it.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn authorize(
        &self,
        _client: &mut (dyn AsyncRead + Unpin + Send),
        _peer_addr: SocketAddr,
    ) -> bool {
        true
    }
}

/// User name and password pair.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Extract credentials from the first bytes of a request.
///
/// The second whitespace-separated token is taken as the path. The user is
/// the text between the last `uname=` and the last `&upass=`, the password is
/// everything after the last `upass=`.
pub fn parse_credentials(request: &[u8]) -> Option<Credentials> {
    let text = String::from_utf8_lossy(request);
    let path = text.split_whitespace().nth(1)?;

    let user_start = path.rfind(USER_FIELD)? + USER_FIELD.len();
    let user_end = path.rfind(PASSWORD_DELIMITER)?;
    if user_end < user_start {
        return None;
    }
    let password_start = path.rfind(PASSWORD_FIELD)? + PASSWORD_FIELD.len();

    Some(Credentials::new(
        &path[user_start..user_end],
        &path[password_start..],
    ))
}

/// Reference credential check against one expected pair.
#[derive(Debug, Clone)]
pub struct CredentialCheck {
    expected: Credentials,
    read_timeout: Duration,
    max_bytes: usize,
}

impl CredentialCheck {
    pub fn new(expected: Credentials) -> Self {
        Self {
            expected,
            read_timeout: DEFAULT_AUTH_READ_TIMEOUT,
            max_bytes: DEFAULT_AUTH_MAX_BYTES,
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }
}

#[async_trait]
impl Authorizer for CredentialCheck {
    async fn authorize(
        &self,
        client: &mut (dyn AsyncRead + Unpin + Send),
        peer_addr: SocketAddr,
    ) -> bool {
        let mut buf = vec![0u8; self.max_bytes];
        let n = match timeout(self.read_timeout, client.read(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                debug!(peer_addr = %peer_addr, error = %e, "Failed to read credentials");
                return false;
            }
            Err(_) => {
                warn!(peer_addr = %peer_addr, "Credential read timeout");
                return false;
            }
        };

        match parse_credentials(&buf[..n]) {
            Some(credentials) if credentials == self.expected => {
                info!(peer_addr = %peer_addr, user = %credentials.user, "Client authenticated");
                true
            }
            Some(credentials) => {
                info!(peer_addr = %peer_addr, user = %credentials.user, "Credentials mismatch");
                false
            }
            None => {
                debug!(peer_addr = %peer_addr, bytes = n, "Malformed credential payload");
                false
            }
        }
    }
}
