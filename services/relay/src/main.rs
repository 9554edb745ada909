//! portfwd
//!
//! TCP port-forwarding relay.
//!
//! This binary:
//! - Loads one or more relay instances from the environment
//! - Binds each instance's listening socket
//! - Grants run permission through a marker file and runs every instance
//! - On interrupt, revokes the permission and waits for instances to stop
//!
//! The relays only end on failure or revoked permission, so the process
//! always exits non-zero.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use portfwd_relay::config::Config;
use portfwd_relay::{MarkerFile, Relay, Supervisor};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("portfwd: invalid configuration: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize tracing (prefer RUST_LOG, fallback to PORTFWD_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    if let Err(e) = run(config).await {
        error!(error = %format!("{e:#}"), "Fatal error");
    }
    ExitCode::FAILURE
}

async fn run(config: Config) -> Result<()> {
    info!("Starting portfwd");
    info!(
        instance_count = config.instances.len(),
        run_marker = %config.run_marker.display(),
        "Configuration loaded"
    );

    let marker = MarkerFile::new(&config.run_marker);
    let permission = Arc::new(marker.clone());

    let mut relays = Vec::with_capacity(config.instances.len());
    for instance in &config.instances {
        let relay = Relay::bind(
            instance.relay.clone(),
            instance.authorizer(),
            permission.clone(),
        )
        .await
        .with_context(|| format!("Failed to start instance {:?}", instance.relay.name))?;

        info!(
            instance = %instance.relay.name,
            bind_addr = %relay.local_addr()?,
            forward_to = %instance.relay.forward_to,
            authentication = if instance.relay.authentication { "enabled" } else { "disabled" },
            "Listener bound"
        );
        relays.push(relay);
    }

    let supervisor = Supervisor::new(marker).with_join_timeout(config.join_timeout);
    let report = supervisor.run(relays, shutdown_signal()).await?;

    info!(
        interrupted = report.interrupted,
        instances = report.outcomes.len(),
        "Bye"
    );
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Interrupt received"),
        Err(e) => {
            error!(error = %e, "Failed to listen for interrupt");
            std::future::pending::<()>().await;
        }
    }
}
