use crate::error::Error;
use crate::transport::Connection;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, instrument, warn};

// ============================================================================
// Peer
// ============================================================================

/// A connected endpoint, identified by its connection handle.
///
/// Cloning is cheap and shares the underlying connection. The registry and
/// the peer's reader thread usually each hold a clone. Two peers are equal
/// iff their handles are equal.
#[derive(Clone)]
pub struct Peer {
    conn: Arc<dyn Connection>,
}

impl Peer {
    pub fn new(conn: Arc<dyn Connection>) -> Self {
        Self { conn }
    }

    /// The connection handle.
    pub fn id(&self) -> usize {
        self.conn.id()
    }

    /// The remote address, for diagnostics.
    pub fn addr(&self) -> SocketAddr {
        self.conn.peer_addr()
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Peer {}

impl PartialOrd for Peer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Peer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id().cmp(&other.id())
    }
}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id())
            .field("addr", &self.addr())
            .finish()
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr())
    }
}

// ============================================================================
// DeliveryFailure
// ============================================================================

/// One failed write inside a fan-out send.
#[derive(Debug)]
pub struct DeliveryFailure {
    pub peer: Peer,
    pub error: Error,
}

// ============================================================================
// ClientRegistry
// ============================================================================

/// Thread-safe set of connected peers.
///
/// All operations take one short-lived lock, except
/// [`broadcast`](Self::broadcast) and [`shutdown_all`](Self::shutdown_all),
/// which keep it for the whole fan-out so they see a consistent membership.
/// Connections must not call back into the registry from `send` or
/// `shutdown`.
///
/// Lifecycle of a peer: unregistered, registered after [`add`](Self::add),
/// removed after [`remove`](Self::remove). Removal shuts the connection down
/// and is final.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: Mutex<BTreeMap<usize, Peer>>,
}

impl ClientRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    // ============================================================================
    // Membership
    // ============================================================================

    /// Registers `peer`. Adding a peer that is already registered is a no-op.
    ///
    /// Returns `true` if the peer was newly added.
    #[instrument(skip(self, peer), fields(id = peer.id()))]
    pub fn add(&self, peer: Peer) -> bool {
        let mut clients = self.lock();
        if clients.contains_key(&peer.id()) {
            debug!(addr = %peer, "Client already registered");
            return false;
        }
        info!(addr = %peer, "New client connected");
        clients.insert(peer.id(), peer);
        true
    }

    /// Shuts down and unregisters `peer`.
    ///
    /// Returns [`Error::PeerNotFound`] and changes nothing if `peer` is not
    /// registered. A failing shutdown is logged; the peer is removed anyway.
    #[instrument(skip(self, peer), fields(id = peer.id()))]
    pub fn remove(&self, peer: &Peer) -> Result<(), Error> {
        let mut clients = self.lock();
        match clients.remove(&peer.id()) {
            Some(peer) => {
                shutdown_peer(&peer);
                info!(addr = %peer, "Client disconnected");
                Ok(())
            }
            None => {
                warn!(addr = %peer, "Client not found in client set");
                Err(Error::PeerNotFound { id: peer.id() })
            }
        }
    }

    /// Like [`remove`](Self::remove), but treats an unknown peer as already
    /// gone. Returns `true` if the peer was registered.
    pub fn discard(&self, peer: &Peer) -> bool {
        let mut clients = self.lock();
        match clients.remove(&peer.id()) {
            Some(peer) => {
                shutdown_peer(&peer);
                info!(id = peer.id(), addr = %peer, "Client disconnected");
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, peer: &Peer) -> bool {
        self.lock().contains_key(&peer.id())
    }

    /// Looks a registered peer up by its connection handle.
    pub fn get(&self, id: usize) -> Option<Peer> {
        self.lock().get(&id).cloned()
    }

    /// Snapshot of all registered peers, ordered by handle.
    pub fn peers(&self) -> Vec<Peer> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // ============================================================================
    // Data Operations
    // ============================================================================

    /// Writes `buf` to `peer`.
    ///
    /// Membership is checked first; sending to an unregistered peer returns
    /// [`Error::PeerNotFound`] without touching the connection. The write
    /// itself happens outside the lock.
    #[instrument(skip(self, peer, buf), fields(id = peer.id(), len = buf.len()))]
    pub fn send(&self, peer: &Peer, buf: &[u8]) -> Result<(), Error> {
        let Some(peer) = self.get(peer.id()) else {
            warn!(addr = %peer, "Can't find this client");
            return Err(Error::PeerNotFound { id: peer.id() });
        };
        peer.connection().send(buf)
    }

    /// Sends `buf` to each of `peers` in turn.
    ///
    /// A failure for one peer does not stop the others. Returns every
    /// failure, including peers that are not registered.
    #[instrument(skip(self, peers, buf), fields(count = peers.len(), len = buf.len()))]
    pub fn send_many(&self, peers: &[Peer], buf: &[u8]) -> Vec<DeliveryFailure> {
        let mut failures = Vec::new();
        for peer in peers {
            if let Err(error) = self.send(peer, buf) {
                failures.push(DeliveryFailure {
                    peer: peer.clone(),
                    error,
                });
            }
        }
        failures
    }

    /// Sends `buf` to every registered peer while holding the lock.
    ///
    /// This is an I/O-bound critical section: a slow peer stalls every other
    /// registry operation until the fan-out completes. Failed writes are
    /// logged and returned; they do not abort delivery to the rest.
    #[instrument(skip(self, buf), fields(len = buf.len()))]
    pub fn broadcast(&self, buf: &[u8]) -> Vec<DeliveryFailure> {
        let clients = self.lock();
        debug!(count = clients.len(), "Broadcasting data");

        let mut failures = Vec::new();
        for peer in clients.values() {
            if let Err(error) = peer.connection().send(buf) {
                warn!(id = peer.id(), addr = %peer, ?error, "Broadcast to client failed");
                failures.push(DeliveryFailure {
                    peer: peer.clone(),
                    error,
                });
            }
        }
        failures
    }

    /// Shuts down every registered connection while holding the lock.
    ///
    /// Peers stay registered; their reader threads unregister them when they
    /// observe the end of their stream.
    pub fn shutdown_all(&self) {
        self.shutdown_all_then(|| ());
    }

    /// Like [`shutdown_all`](Self::shutdown_all), then runs `f` before the
    /// lock is released and returns its result.
    ///
    /// `f` must not call back into the registry.
    #[instrument(skip(self, f))]
    pub fn shutdown_all_then<R>(&self, f: impl FnOnce() -> R) -> R {
        let clients = self.lock();
        info!(count = clients.len(), "Shutting down all clients");
        for peer in clients.values() {
            shutdown_peer(peer);
        }
        f()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<usize, Peer>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn shutdown_peer(peer: &Peer) {
    if let Err(err) = peer.connection().shutdown() {
        warn!(id = peer.id(), addr = %peer, ?err, "Error shutting down client");
    }
}
