//! Relay listener and dispatch loop.
//!
//! One [`Relay`] owns one listening socket and every pair it has created. A
//! single task waits for readiness across the listener and all paired
//! sockets, then dispatches:
//! - listener ready: accept, authorize, connect the backend, register the pair
//! - paired socket ready: read one chunk and write it verbatim to the partner,
//!   or tear down the pair on EOF or error
//!
//! Every stopper delay the run permission is polled; once it is revoked the
//! loop closes all remaining pairs and stops.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{select_all, FutureExt};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, instrument, trace, warn};

use super::auth::Authorizer;
use super::backend::{BackendConnector, ForwardTarget, DEFAULT_CONNECT_TIMEOUT};
use super::registry::{ConnectionPairRegistry, Side, SocketId};
use crate::error::RelayError;
use crate::permission::RunPermission;

/// Default sleep before each readiness wait.
pub const DEFAULT_POLL_DELAY: Duration = Duration::from_micros(100);

/// Default read chunk size.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Default readiness timeout and run-permission period.
pub const DEFAULT_STOPPER_DELAY: Duration = Duration::from_secs(3);

/// Default bound on writing one chunk to a peer.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Listen backlog.
pub const LISTEN_BACKLOG: u32 = 200;

/// Shortest sleep the tokio timer resolves.
const TIMER_TICK: Duration = Duration::from_millis(1);

/// Configuration for one relay instance.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Instance name, attached to every log line of the instance.
    pub name: String,
    /// Address to listen on.
    pub bind_addr: SocketAddr,
    /// Where accepted clients are forwarded.
    pub forward_to: ForwardTarget,
    /// Sleep before each readiness wait.
    pub poll_delay: Duration,
    /// Read chunk size.
    pub buffer_size: usize,
    /// Readiness timeout and run-permission period.
    pub stopper_delay: Duration,
    /// Whether clients must pass the authorizer.
    pub authentication: bool,
    /// Bound on backend connect attempts.
    pub connect_timeout: Duration,
    /// Bound on writing one chunk to a peer.
    pub write_timeout: Duration,
}

impl RelayConfig {
    /// Create a configuration with default tunables.
    pub fn new(name: impl Into<String>, bind_addr: SocketAddr, forward_to: ForwardTarget) -> Self {
        Self {
            name: name.into(),
            bind_addr,
            forward_to,
            poll_delay: DEFAULT_POLL_DELAY,
            buffer_size: DEFAULT_BUFFER_SIZE,
            stopper_delay: DEFAULT_STOPPER_DELAY,
            authentication: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

/// Statistics for a relay instance.
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Clients rejected by the authorizer.
    pub connections_unauthorized: AtomicU64,
    /// Backend connection failures.
    pub backend_failed: AtomicU64,
    /// Pairs registered.
    pub pairs_opened: AtomicU64,
    /// Pairs torn down.
    pub pairs_closed: AtomicU64,
    /// Pairs currently registered.
    pub pairs_active: AtomicU64,
    /// Bytes relayed client to backend.
    pub bytes_to_backend: AtomicU64,
    /// Bytes relayed backend to client.
    pub bytes_from_backend: AtomicU64,
}

/// Spreads sub-tick poll delays over several iterations.
///
/// Each iteration owes `poll_delay`. Below one timer tick the loop only
/// yields; once the owed delay reaches a tick it is slept off in one go.
#[derive(Debug)]
struct PollPacer {
    poll_delay: Duration,
    owed: Duration,
}

impl PollPacer {
    fn new(poll_delay: Duration) -> Self {
        Self {
            poll_delay,
            owed: Duration::ZERO,
        }
    }

    /// Account one iteration; returns the sleep due now, if any.
    fn next_sleep(&mut self) -> Option<Duration> {
        self.owed += self.poll_delay;
        if self.owed < TIMER_TICK {
            return None;
        }
        Some(std::mem::take(&mut self.owed))
    }

    async fn pause(&mut self) {
        match self.next_sleep() {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
    }
}

/// What a readiness wait produced.
enum Readiness {
    Incoming(io::Result<(TcpStream, SocketAddr)>),
    Readable(Vec<SocketId>),
    Idle,
}

/// A single relay instance.
pub struct Relay {
    config: RelayConfig,
    listener: TcpListener,
    connector: BackendConnector,
    authorizer: Arc<dyn Authorizer>,
    permission: Arc<dyn RunPermission>,
    registry: ConnectionPairRegistry<TcpStream>,
    stats: Arc<RelayStats>,
}

impl Relay {
    /// Bind the listening socket.
    ///
    /// `authorizer` is only consulted when `config.authentication` is set.
    pub async fn bind(
        config: RelayConfig,
        authorizer: Arc<dyn Authorizer>,
        permission: Arc<dyn RunPermission>,
    ) -> Result<Self, RelayError> {
        let listener = bind_listener(config.bind_addr).map_err(|source| RelayError::Bind {
            addr: config.bind_addr,
            source,
        })?;

        let connector =
            BackendConnector::with_timeout(config.forward_to.clone(), config.connect_timeout);

        Ok(Self {
            config,
            listener,
            connector,
            authorizer,
            permission,
            registry: ConnectionPairRegistry::new(),
            stats: Arc::new(RelayStats::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Get the local address this relay is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared handle to the statistics, readable while the relay runs.
    pub fn stats(&self) -> Arc<RelayStats> {
        Arc::clone(&self.stats)
    }

    /// Run until the permission is revoked or the listener fails.
    ///
    /// Never returns `Ok`. Pairs still registered when the loop ends are
    /// closed before returning.
    #[instrument(name = "relay", skip_all, fields(instance = %self.config.name))]
    pub async fn run(mut self) -> Result<Infallible, RelayError> {
        let local_addr = self.listener.local_addr().map_err(RelayError::Accept)?;
        info!(
            bind_addr = %local_addr,
            forward_to = %self.config.forward_to,
            authentication = self.config.authentication,
            "Relay started"
        );

        let result = self.dispatch_loop().await;

        let remaining = self.registry.drain();
        if !remaining.is_empty() {
            info!(pairs = remaining.len(), "Closing remaining pairs");
        }
        for pair in remaining {
            self.record_closed();
            drop(pair);
        }

        match &result {
            Err(e) if e.is_stop_request() => info!("Stop signal received, relay stopped"),
            Err(e) => error!(error = %e, "Relay failed"),
            Ok(never) => match *never {},
        }
        result
    }

    async fn dispatch_loop(&mut self) -> Result<Infallible, RelayError> {
        let mut buf = vec![0u8; self.config.buffer_size.max(1)];
        let mut checkpoint = Instant::now();
        let mut pacer = PollPacer::new(self.config.poll_delay);

        loop {
            pacer.pause().await;

            // The listener is polled first; a pending accept ends the batch.
            let readiness = tokio::select! {
                biased;
                accepted = self.listener.accept() => Readiness::Incoming(accepted),
                batch = wait_readable(&self.registry) => Readiness::Readable(batch),
                _ = tokio::time::sleep(self.config.stopper_delay) => Readiness::Idle,
            };

            match readiness {
                Readiness::Incoming(Ok((stream, peer_addr))) => {
                    self.on_accept(stream, peer_addr).await;
                }
                Readiness::Incoming(Err(e)) if is_transient_accept_error(&e) => {
                    debug!(error = %e, "Pending connection dropped before accept");
                }
                Readiness::Incoming(Err(e)) => return Err(RelayError::Accept(e)),
                Readiness::Readable(batch) => {
                    for id in batch {
                        self.on_readable(id, &mut buf).await;
                    }
                }
                Readiness::Idle => {}
            }

            if checkpoint.elapsed() >= self.config.stopper_delay {
                checkpoint = Instant::now();
                if !self.permission.is_allowed() {
                    return Err(RelayError::PermissionRevoked);
                }
            }
        }
    }

    /// Authorize a new client and pair it with a fresh backend connection.
    async fn on_accept(&mut self, mut client: TcpStream, peer_addr: SocketAddr) {
        self.stats
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);

        if self.config.authentication {
            if !self.authorizer.authorize(&mut client, peer_addr).await {
                self.stats
                    .connections_unauthorized
                    .fetch_add(1, Ordering::Relaxed);
                info!(peer_addr = %peer_addr, "Client not authenticated, rejecting connection");
                return;
            }
        } else {
            debug!(peer_addr = %peer_addr, "Connecting client without authentication");
        }

        let backend = match self.connector.connect().await {
            Ok(stream) => stream,
            Err(e) => {
                self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    peer_addr = %peer_addr,
                    forward_to = %self.config.forward_to,
                    error = %e,
                    "Can't establish backend connection, closing client"
                );
                return;
            }
        };

        let backend_addr = match backend.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                warn!(peer_addr = %peer_addr, error = %e, "Backend closed during connect");
                return;
            }
        };

        let ids = self
            .registry
            .insert_pair(client, peer_addr, backend, backend_addr);
        self.stats.pairs_opened.fetch_add(1, Ordering::Relaxed);
        self.stats.pairs_active.fetch_add(1, Ordering::Relaxed);

        info!(
            peer_addr = %peer_addr,
            backend_addr = %backend_addr,
            client = %ids.client,
            backend = %ids.backend,
            "Client connected"
        );
    }

    /// Read one chunk from `id` and forward it to its partner.
    async fn on_readable(&mut self, id: SocketId, buf: &mut [u8]) {
        // Sockets torn down earlier in this batch are skipped.
        let Some(endpoint) = self.registry.get(id) else {
            return;
        };

        let side = endpoint.side;

        let n = match endpoint.stream.try_read(buf) {
            Ok(0) => {
                self.on_close(id, side, None);
                return;
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                self.on_close(id, side, Some(&e));
                return;
            }
        };

        // A failed forward is a failure of the partner's side.
        if let Err(e) = self.on_data(id, &buf[..n]).await {
            self.on_close(id, side.opposite(), Some(&e));
        }
    }

    /// Write `data` unmodified to the partner of `id`.
    async fn on_data(&mut self, id: SocketId, data: &[u8]) -> io::Result<()> {
        let write_timeout = self.config.write_timeout;
        let Some(partner) = self.registry.partner_mut(id) else {
            return Ok(());
        };

        match timeout(write_timeout, partner.stream.write_all(data)).await {
            Ok(result) => result?,
            Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "write timeout")),
        }

        let counter = match partner.side {
            Side::Backend => &self.stats.bytes_to_backend,
            Side::Client => &self.stats.bytes_from_backend,
        };
        counter.fetch_add(data.len() as u64, Ordering::Relaxed);
        trace!(from = %id, bytes = data.len(), "Relayed chunk");

        Ok(())
    }

    /// Tear down the pair `id` belongs to.
    ///
    /// `side` is the half that closed or failed.
    fn on_close(&mut self, id: SocketId, side: Side, error: Option<&io::Error>) {
        let Some(pair) = self.registry.remove_pair(id) else {
            return;
        };
        self.record_closed();

        match error {
            Some(e) => warn!(
                peer_addr = %pair.client.peer_addr,
                backend_addr = %pair.backend.peer_addr,
                side = %side,
                error = %e,
                "Relay error, closing pair"
            ),
            None => info!(
                peer_addr = %pair.client.peer_addr,
                backend_addr = %pair.backend.peer_addr,
                side = %side,
                "Disconnected"
            ),
        }
        // Both sockets close here.
        drop(pair);
    }

    fn record_closed(&self) {
        self.stats.pairs_closed.fetch_add(1, Ordering::Relaxed);
        self.stats.pairs_active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Create the listening socket with address reuse enabled.
fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

/// Accept errors that concern only the pending connection.
fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Wait until at least one registered socket is readable.
///
/// Returns the first ready socket plus every other socket already ready at
/// that moment. Pends forever when nothing is registered.
async fn wait_readable(registry: &ConnectionPairRegistry<TcpStream>) -> Vec<SocketId> {
    let waits: Vec<_> = registry
        .iter()
        .map(|(id, stream)| {
            async move {
                // A readiness error resurfaces from the following read.
                let _ = stream.readable().await;
                id
            }
            .boxed()
        })
        .collect();

    if waits.is_empty() {
        return std::future::pending().await;
    }

    let (first, _, rest) = select_all(waits).await;
    let mut batch = vec![first];
    batch.extend(rest.into_iter().filter_map(FutureExt::now_or_never));
    batch
}
