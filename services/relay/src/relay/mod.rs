//! TCP port-forwarding relay.
//!
//! This module provides:
//! - The listening socket and single-task dispatch loop
//! - Client authorization before any backend is contacted
//! - Backend connections to a fixed forward target
//! - The registry pairing each client socket with its backend socket
//!
//! ## Architecture
//!
//! ```text
//! Client -> Relay -> Authorizer -> BackendConnector -> Backend
//!             |
//!   ConnectionPairRegistry (client <-> backend)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use portfwd_relay::{AllowAll, PermissionFlag, Relay, RelayConfig};
//!
//! let config = RelayConfig::new("front", "0.0.0.0:5173".parse()?, "[::1]:5174".parse()?);
//! let relay = Relay::bind(config, Arc::new(AllowAll), Arc::new(PermissionFlag::default())).await?;
//! relay.run().await?;
//! ```

mod auth;
mod backend;
mod listener;
mod registry;

pub use auth::{
    parse_credentials, AllowAll, Authorizer, CredentialCheck, Credentials,
    DEFAULT_AUTH_READ_TIMEOUT,
};
pub use backend::{BackendConnector, ForwardTarget, DEFAULT_CONNECT_TIMEOUT};
pub use listener::{
    Relay, RelayConfig, RelayStats, DEFAULT_BUFFER_SIZE, DEFAULT_POLL_DELAY,
    DEFAULT_STOPPER_DELAY, DEFAULT_WRITE_TIMEOUT,
};
pub use registry::{ConnectionPairRegistry, Endpoint, PairIds, RemovedPair, Side, SocketId};
