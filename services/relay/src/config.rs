//! Relay configuration.
//!
//! Everything is env-driven. Each relay instance reads its own set of
//! variables prefixed with `PORTFWD_<NAME>_`, where `<NAME>` is the instance
//! name upper-cased with `-` mapped to `_`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::permission::DEFAULT_MARKER_FILE;
use crate::relay::{
    AllowAll, Authorizer, CredentialCheck, Credentials, ForwardTarget, RelayConfig,
    DEFAULT_BUFFER_SIZE,
};

/// Instances started when `PORTFWD_INSTANCES` is unset.
pub const DEFAULT_INSTANCES: &str = "front,back";

/// Default wait for instances after revoking run permission.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Process configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Relay instances to run, in start order.
    pub instances: Vec<InstanceConfig>,

    /// Run-permission marker file.
    pub run_marker: PathBuf,

    /// How long the supervisor waits for instances after revoking permission.
    pub join_timeout: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Configuration for one relay instance.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub relay: RelayConfig,

    /// Expected credentials; set exactly when authentication is enabled.
    pub credentials: Option<Credentials>,
}

impl InstanceConfig {
    /// Build the authorizer this instance was configured with.
    pub fn authorizer(&self) -> Arc<dyn Authorizer> {
        match &self.credentials {
            Some(credentials) => Arc::new(CredentialCheck::new(credentials.clone())),
            None => Arc::new(AllowAll),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let names = get("PORTFWD_INSTANCES").unwrap_or_else(|| DEFAULT_INSTANCES.to_string());
        let names: Vec<&str> = names
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .collect();

        if names.is_empty() {
            bail!("PORTFWD_INSTANCES must name at least one instance.");
        }

        let mut instances = Vec::with_capacity(names.len());
        for name in names {
            if instances
                .iter()
                .any(|i: &InstanceConfig| i.relay.name == name)
            {
                bail!("Instance {name:?} is listed twice in PORTFWD_INSTANCES.");
            }
            instances.push(load_instance(&get, name)?);
        }

        let run_marker = get("PORTFWD_RUN_MARKER")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MARKER_FILE));

        let join_timeout_secs: u64 = parse_var(&get, "PORTFWD_JOIN_TIMEOUT_SECS", "integer (seconds)")?
            .unwrap_or(DEFAULT_JOIN_TIMEOUT.as_secs());

        let log_level = get("PORTFWD_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            instances,
            run_marker,
            join_timeout: Duration::from_secs(join_timeout_secs),
            log_level,
        })
    }
}

fn load_instance<F>(get: &F, name: &str) -> Result<InstanceConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let prefix = format!("PORTFWD_{}", name.to_uppercase().replace('-', "_"));
    let key = |suffix: &str| format!("{prefix}_{suffix}");

    let listen_key = key("LISTEN");
    let bind_addr: SocketAddr = get(&listen_key)
        .with_context(|| format!("Missing listen address for {name:?}. Set {listen_key}."))?
        .parse()
        .with_context(|| format!("{listen_key} must be a socket address (ip:port)."))?;

    let forward_key = key("FORWARD");
    let forward_to: ForwardTarget = get(&forward_key)
        .with_context(|| format!("Missing forward target for {name:?}. Set {forward_key}."))?
        .parse()
        .with_context(|| format!("{forward_key} must be host:port."))?;

    let mut relay = RelayConfig::new(name, bind_addr, forward_to);

    if let Some(us) = parse_var::<u64, _>(get, &key("POLL_DELAY_US"), "integer (microseconds)")? {
        relay.poll_delay = Duration::from_micros(us);
    }

    relay.buffer_size = parse_var(get, &key("BUFFER_SIZE"), "integer (bytes)")?
        .unwrap_or(DEFAULT_BUFFER_SIZE)
        .max(1);

    if let Some(ms) = parse_var::<u64, _>(get, &key("STOPPER_DELAY_MS"), "integer (milliseconds)")? {
        relay.stopper_delay = Duration::from_millis(ms.max(10));
    }

    if let Some(ms) = parse_var::<u64, _>(get, &key("CONNECT_TIMEOUT_MS"), "integer (milliseconds)")? {
        relay.connect_timeout = Duration::from_millis(ms);
    }

    if let Some(ms) = parse_var::<u64, _>(get, &key("WRITE_TIMEOUT_MS"), "integer (milliseconds)")? {
        relay.write_timeout = Duration::from_millis(ms);
    }

    relay.authentication = get(&key("AUTH"))
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false);

    let credentials = if relay.authentication {
        let user_key = key("AUTH_USER");
        let pass_key = key("AUTH_PASS");
        let user = get(&user_key)
            .with_context(|| format!("Authentication enabled for {name:?} but {user_key} is unset."))?;
        let password = get(&pass_key)
            .with_context(|| format!("Authentication enabled for {name:?} but {pass_key} is unset."))?;
        Some(Credentials::new(user, password))
    } else {
        None
    };

    Ok(InstanceConfig { relay, credentials })
}

fn parse_var<T, F>(get: &F, key: &str, expected: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("{key} must be an {expected}."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::relay::{DEFAULT_POLL_DELAY, DEFAULT_STOPPER_DELAY};

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    fn base_vars() -> Vec<(&'static str, &'static str)> {
        vec![
            ("PORTFWD_FRONT_LISTEN", "0.0.0.0:5173"),
            ("PORTFWD_FRONT_FORWARD", "[::1]:5174"),
            ("PORTFWD_BACK_LISTEN", "127.0.0.1:8000"),
            ("PORTFWD_BACK_FORWARD", "127.0.0.1:2024"),
        ]
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&base_vars())).unwrap();

        assert_eq!(config.instances.len(), 2);
        assert_eq!(config.run_marker, PathBuf::from("stop.no"));
        assert_eq!(config.join_timeout, DEFAULT_JOIN_TIMEOUT);
        assert_eq!(config.log_level, "info");

        let front = &config.instances[0];
        assert_eq!(front.relay.name, "front");
        assert_eq!(front.relay.bind_addr, "0.0.0.0:5173".parse().unwrap());
        assert_eq!(front.relay.forward_to, ForwardTarget::new("::1", 5174));
        assert_eq!(front.relay.poll_delay, DEFAULT_POLL_DELAY);
        assert_eq!(front.relay.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(front.relay.stopper_delay, DEFAULT_STOPPER_DELAY);
        assert!(!front.relay.authentication);
        assert!(front.credentials.is_none());

        assert_eq!(config.instances[1].relay.name, "back");
    }

    #[test]
    fn test_instance_overrides() {
        let mut vars = vec![
            ("PORTFWD_INSTANCES", "edge-a"),
            ("PORTFWD_EDGE_A_LISTEN", "[::]:9000"),
            ("PORTFWD_EDGE_A_FORWARD", "10.0.0.5:80"),
            ("PORTFWD_EDGE_A_POLL_DELAY_US", "0"),
            ("PORTFWD_EDGE_A_BUFFER_SIZE", "512"),
            ("PORTFWD_EDGE_A_STOPPER_DELAY_MS", "250"),
            ("PORTFWD_EDGE_A_CONNECT_TIMEOUT_MS", "700"),
            ("PORTFWD_EDGE_A_WRITE_TIMEOUT_MS", "1500"),
            ("PORTFWD_EDGE_A_AUTH", "true"),
            ("PORTFWD_EDGE_A_AUTH_USER", "admin"),
            ("PORTFWD_EDGE_A_AUTH_PASS", "secret"),
            ("PORTFWD_RUN_MARKER", "/run/portfwd/allowed"),
            ("PORTFWD_JOIN_TIMEOUT_SECS", "3"),
        ];
        vars.push(("PORTFWD_LOG_LEVEL", "debug"));

        let config = Config::from_lookup(lookup(&vars)).unwrap();
        assert_eq!(config.instances.len(), 1);

        let edge = &config.instances[0];
        assert_eq!(edge.relay.name, "edge-a");
        assert!(edge.relay.poll_delay.is_zero());
        assert_eq!(edge.relay.buffer_size, 512);
        assert_eq!(edge.relay.stopper_delay, Duration::from_millis(250));
        assert_eq!(edge.relay.connect_timeout, Duration::from_millis(700));
        assert_eq!(edge.relay.write_timeout, Duration::from_millis(1500));
        assert!(edge.relay.authentication);
        assert_eq!(edge.credentials, Some(Credentials::new("admin", "secret")));

        assert_eq!(config.run_marker, PathBuf::from("/run/portfwd/allowed"));
        assert_eq!(config.join_timeout, Duration::from_secs(3));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_tunables_are_clamped() {
        let mut vars = base_vars();
        vars.push(("PORTFWD_FRONT_BUFFER_SIZE", "0"));
        vars.push(("PORTFWD_FRONT_STOPPER_DELAY_MS", "1"));

        let config = Config::from_lookup(lookup(&vars)).unwrap();
        assert_eq!(config.instances[0].relay.buffer_size, 1);
        assert_eq!(
            config.instances[0].relay.stopper_delay,
            Duration::from_millis(10)
        );
    }

    #[test]
    fn test_missing_listen_is_error() {
        let vars = vec![("PORTFWD_INSTANCES", "solo"), ("PORTFWD_SOLO_FORWARD", "h:1")];
        let err = Config::from_lookup(lookup(&vars)).unwrap_err();
        assert!(err.to_string().contains("PORTFWD_SOLO_LISTEN"));
    }

    #[test]
    fn test_bad_values_are_errors() {
        let mut vars = base_vars();
        vars.push(("PORTFWD_BACK_BUFFER_SIZE", "lots"));
        let err = Config::from_lookup(lookup(&vars)).unwrap_err();
        assert!(err.to_string().contains("PORTFWD_BACK_BUFFER_SIZE"));

        let mut vars = base_vars();
        vars.retain(|(k, _)| *k != "PORTFWD_FRONT_FORWARD");
        vars.push(("PORTFWD_FRONT_FORWARD", "no-port"));
        let err = Config::from_lookup(lookup(&vars)).unwrap_err();
        assert!(err.to_string().contains("PORTFWD_FRONT_FORWARD"));
    }

    #[test]
    fn test_auth_requires_credentials() {
        let mut vars = base_vars();
        vars.push(("PORTFWD_FRONT_AUTH", "1"));
        vars.push(("PORTFWD_FRONT_AUTH_USER", "admin"));
        let err = Config::from_lookup(lookup(&vars)).unwrap_err();
        assert!(err.to_string().contains("PORTFWD_FRONT_AUTH_PASS"));
    }

    #[test]
    fn test_duplicate_and_empty_instances() {
        let mut vars = base_vars();
        vars.push(("PORTFWD_INSTANCES", "front, front"));
        assert!(Config::from_lookup(lookup(&vars)).is_err());

        let vars = vec![("PORTFWD_INSTANCES", " , ")];
        assert!(Config::from_lookup(lookup(&vars)).is_err());
    }
}
