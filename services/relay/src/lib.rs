pub mod config;
pub mod error;
pub mod permission;
pub mod relay;
pub mod supervisor;

pub use error::{RelayError, TargetParseError};
pub use permission::{MarkerFile, PermissionFlag, RunPermission};
pub use relay::{
    AllowAll, Authorizer, BackendConnector, ConnectionPairRegistry, CredentialCheck, Credentials,
    ForwardTarget, Relay, RelayConfig, RelayStats, Side, SocketId,
};
pub use supervisor::{InstanceOutcome, Supervisor, SupervisorReport};
