//! Connection pair registry.
//!
//! Owns every paired socket of one relay instance. Each entry points at its
//! partner, and pairs only enter and leave the registry as a unit, so the
//! dispatch loop can never observe a half-open pair.
//!
//! The registry is generic over the socket type so it can be exercised with
//! plain values in tests; the relay uses it with `TcpStream`.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

/// Identifier of a registered socket, unique within one registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sock-{}", self.0)
    }
}

/// Which half of a pair a socket is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Backend,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Client => "client",
            Side::Backend => "backend",
        }
    }

    /// The other half of the pair.
    pub fn opposite(self) -> Side {
        match self {
            Side::Client => Side::Backend,
            Side::Backend => Side::Client,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One registered socket.
#[derive(Debug)]
pub struct Endpoint<S> {
    pub stream: S,
    pub peer_addr: SocketAddr,
    pub side: Side,
    partner: SocketId,
}

/// Ids assigned to a newly registered pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairIds {
    pub client: SocketId,
    pub backend: SocketId,
}

/// Both halves of a pair after removal. Dropping it closes the sockets.
#[derive(Debug)]
pub struct RemovedPair<S> {
    pub client: Endpoint<S>,
    pub backend: Endpoint<S>,
}

/// Bidirectional client/backend mapping plus the monitored socket set.
#[derive(Debug)]
pub struct ConnectionPairRegistry<S> {
    sockets: HashMap<SocketId, Endpoint<S>>,
    next_id: u64,
}

impl<S> ConnectionPairRegistry<S> {
    pub fn new() -> Self {
        Self {
            sockets: HashMap::new(),
            next_id: 0,
        }
    }

    fn allocate_id(&mut self) -> SocketId {
        let id = SocketId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Register a client and its backend as one pair.
    pub fn insert_pair(
        &mut self,
        client: S,
        client_addr: SocketAddr,
        backend: S,
        backend_addr: SocketAddr,
    ) -> PairIds {
        let ids = PairIds {
            client: self.allocate_id(),
            backend: self.allocate_id(),
        };

        self.sockets.insert(
            ids.client,
            Endpoint {
                stream: client,
                peer_addr: client_addr,
                side: Side::Client,
                partner: ids.backend,
            },
        );
        self.sockets.insert(
            ids.backend,
            Endpoint {
                stream: backend,
                peer_addr: backend_addr,
                side: Side::Backend,
                partner: ids.client,
            },
        );

        ids
    }

    pub fn get(&self, id: SocketId) -> Option<&Endpoint<S>> {
        self.sockets.get(&id)
    }

    pub fn partner(&self, id: SocketId) -> Option<SocketId> {
        self.sockets.get(&id).map(|e| e.partner)
    }

    /// Mutable access to the partner of `id`.
    pub fn partner_mut(&mut self, id: SocketId) -> Option<&mut Endpoint<S>> {
        let partner = self.partner(id)?;
        self.sockets.get_mut(&partner)
    }

    pub fn contains(&self, id: SocketId) -> bool {
        self.sockets.contains_key(&id)
    }

    /// Remove the pair `id` belongs to, both halves at once.
    ///
    /// Returns `None` when `id` was already torn down.
    pub fn remove_pair(&mut self, id: SocketId) -> Option<RemovedPair<S>> {
        let first = self.sockets.remove(&id)?;
        let second = self.sockets.remove(&first.partner)?;

        Some(match first.side {
            Side::Client => RemovedPair {
                client: first,
                backend: second,
            },
            Side::Backend => RemovedPair {
                client: second,
                backend: first,
            },
        })
    }

    /// Remove every pair.
    pub fn drain(&mut self) -> Vec<RemovedPair<S>> {
        let ids: Vec<SocketId> = self
            .sockets
            .iter()
            .filter(|(_, e)| e.side == Side::Client)
            .map(|(id, _)| *id)
            .collect();

        ids.into_iter()
            .filter_map(|id| self.remove_pair(id))
            .collect()
    }

    /// All monitored sockets.
    pub fn iter(&self) -> impl Iterator<Item = (SocketId, &S)> {
        self.sockets.iter().map(|(id, e)| (*id, &e.stream))
    }

    /// Number of monitored sockets (twice the pair count).
    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    pub fn pair_count(&self) -> usize {
        self.sockets.len() / 2
    }
}

impl<S> Default for ConnectionPairRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}
