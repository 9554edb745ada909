//! Relay supervision.
//!
//! The supervisor grants run permission, runs every relay instance as its own
//! task, and on shutdown revokes the permission so the instances stop on
//! their next permission check. Instances that have not stopped within the
//! join timeout are aborted.
//!
//! Instances share nothing but the permission store: a failing or panicking
//! instance does not affect the others.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::{timeout, Instant};
use tracing::{error, info, warn};

use crate::config::DEFAULT_JOIN_TIMEOUT;
use crate::error::RelayError;
use crate::permission::{MarkerFile, RunPermission};
use crate::relay::Relay;

/// How a relay instance ended.
#[derive(Debug)]
pub enum InstanceOutcome {
    /// Stopped after its run permission was revoked.
    Stopped,
    /// Ended with an unrecoverable error.
    Failed(RelayError),
    /// The instance task panicked.
    Panicked(String),
    /// Still running at the join timeout and aborted.
    Aborted,
}

/// Result of a supervised run.
#[derive(Debug, Default)]
pub struct SupervisorReport {
    /// Whether the shutdown signal fired.
    pub interrupted: bool,
    /// Outcome per instance, in the order the instances ended.
    pub outcomes: Vec<(String, InstanceOutcome)>,
}

impl SupervisorReport {
    pub fn outcome(&self, name: &str) -> Option<&InstanceOutcome> {
        self.outcomes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, outcome)| outcome)
    }
}

type InstanceResult = Result<std::convert::Infallible, RelayError>;

/// Starts relay instances and stops them as a unit.
#[derive(Debug, Clone)]
pub struct Supervisor {
    marker: MarkerFile,
    join_timeout: Duration,
}

impl Supervisor {
    pub fn new(marker: MarkerFile) -> Self {
        Self {
            marker,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }

    pub fn with_join_timeout(mut self, join_timeout: Duration) -> Self {
        self.join_timeout = join_timeout;
        self
    }

    /// Run `relays` until they have all ended or `shutdown` resolves.
    ///
    /// The relays should poll this supervisor's marker as their permission.
    /// Fails only if the marker cannot be written.
    pub async fn run<S>(self, relays: Vec<Relay>, shutdown: S) -> io::Result<SupervisorReport>
    where
        S: Future<Output = ()>,
    {
        info!(
            marker = %self.marker.path().display(),
            already_allowed = self.marker.is_allowed(),
            "Granting run permission"
        );
        self.marker.allow()?;

        let mut tasks = JoinSet::new();
        let mut names = HashMap::new();
        for relay in relays {
            let name = relay.name().to_string();
            let handle = tasks.spawn(relay.run());
            names.insert(handle.id(), name);
        }

        let mut report = SupervisorReport::default();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                joined = tasks.join_next_with_id() => match joined {
                    Some(joined) => record(&mut report, &mut names, joined),
                    None => break,
                },
                _ = &mut shutdown => {
                    report.interrupted = true;
                    break;
                }
            }
        }

        if report.interrupted {
            self.stop(&mut tasks, &mut names, &mut report).await;
        } else {
            warn!("All relay instances have ended");
        }

        Ok(report)
    }

    /// Revoke permission, wait for a cooperative stop, abort stragglers.
    async fn stop(
        &self,
        tasks: &mut JoinSet<InstanceResult>,
        names: &mut HashMap<Id, String>,
        report: &mut SupervisorReport,
    ) {
        info!(
            join_timeout_secs = self.join_timeout.as_secs_f64(),
            "Revoking run permission and waiting for instances"
        );
        if let Err(e) = self.marker.disallow() {
            error!(error = %e, "Failed to remove run marker");
        }

        let started = Instant::now();
        let joined = timeout(self.join_timeout, async {
            while let Some(joined) = tasks.join_next_with_id().await {
                record(report, names, joined);
            }
        })
        .await;

        if joined.is_err() {
            warn!(remaining = tasks.len(), "Instances did not stop in time, aborting");
            abort_remaining(tasks, names, report).await;
        }

        info!(
            elapsed_secs = started.elapsed().as_secs_f64(),
            "Instances joined"
        );
    }
}

/// Abort every task still in `tasks` and record how each one ended.
///
/// Tasks that finished before the abort keep their own outcome.
async fn abort_remaining(
    tasks: &mut JoinSet<InstanceResult>,
    names: &mut HashMap<Id, String>,
    report: &mut SupervisorReport,
) {
    tasks.abort_all();
    while let Some(joined) = tasks.join_next_with_id().await {
        record(report, names, joined);
    }
}

fn record(
    report: &mut SupervisorReport,
    names: &mut HashMap<Id, String>,
    joined: Result<(Id, InstanceResult), JoinError>,
) {
    let (id, outcome) = match joined {
        Ok((id, Err(e))) if e.is_stop_request() => (id, InstanceOutcome::Stopped),
        Ok((id, Err(e))) => (id, InstanceOutcome::Failed(e)),
        Ok((_, Ok(never))) => match never {},
        Err(e) if e.is_panic() => (e.id(), InstanceOutcome::Panicked(e.to_string())),
        Err(e) => (e.id(), InstanceOutcome::Aborted),
    };

    let name = names.remove(&id).unwrap_or_else(|| id.to_string());
    match &outcome {
        InstanceOutcome::Stopped => info!(instance = %name, "Instance stopped"),
        InstanceOutcome::Failed(e) => error!(instance = %name, error = %e, "Instance failed"),
        InstanceOutcome::Panicked(msg) => error!(instance = %name, panic = %msg, "Instance panicked"),
        InstanceOutcome::Aborted => warn!(instance = %name, "Instance aborted"),
    }
    report.outcomes.push((name, outcome));
}
