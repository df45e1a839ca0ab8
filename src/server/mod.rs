//! Server composing a listener, the client registry, and the delivery queue.
//!
//! The [`Server`] owns the accept loop and the per-connection reader loop.
//! Inbound bytes from every peer go through that peer's own
//! [`FrameCodec`]; each decoded message lands in the shared
//! [`DeliveryQueue`]. Outbound messages are framed and handed to the
//! [`ClientRegistry`] for unicast or broadcast.

mod registry;

pub use registry::{ClientRegistry, DeliveryFailure, Peer};

use crate::codec::{FrameCodec, MAX_MESSAGE_LEN};
use crate::config::get_namespaced_usize_or;
use crate::error::Error;
use crate::queue::DeliveryQueue;
use crate::transport::{Listener, TcpListenerTransport};

use ::config::Config;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

// Pause after a failed accept so a persistent error does not spin the loop
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Message server over a byte-stream [`Listener`].
///
/// Shared between threads through an `Arc`: one thread runs
/// [`run`](Self::run), reader threads push into the queue, and any number of
/// consumers [`pop`](Self::pop) and reply through [`send`](Self::send) or
/// [`broadcast`](Self::broadcast).
///
/// # Configuration Keys
///
/// - `max_frame_size`: largest inbound message accepted per frame (defaults
///   to [`MAX_MESSAGE_LEN`]); a peer exceeding it is disconnected
/// - Plus all keys of the listener (see [`TcpListenerTransport`])
pub struct Server<L: Listener = TcpListenerTransport> {
    listener: L,
    registry: Arc<ClientRegistry>,
    queue: Arc<DeliveryQueue>,
    max_frame_size: usize,
}

// ============================================================================
// Constructors
// ============================================================================

impl Server {
    /// Creates a TCP server from configuration. Call [`bind`](Self::bind)
    /// and [`listen`](Self::listen) before accepting.
    pub fn new(config: &Config) -> Result<Self, Error> {
        Self::new_named(config, "")
    }

    /// Creates a named TCP server with configuration namespacing.
    ///
    /// Configuration lookup follows this priority:
    /// 1. `{name}.{key}` (e.g., `chat.max_frame_size`)
    /// 2. `{key}` (e.g., `max_frame_size`)
    /// 3. Hard-coded default
    pub fn new_named(config: &Config, name: &str) -> Result<Self, Error> {
        let listener = TcpListenerTransport::new_named(config, name)?;
        Self::with_listener_named(listener, config, name)
    }
}

impl<L: Listener> Server<L> {
    /// Creates a server over any listener, with a fresh registry and queue.
    ///
    /// Fails with [`Error::Config`] if a configuration key is present but
    /// malformed.
    pub fn with_listener(listener: L, config: &Config) -> Result<Self, Error> {
        Self::with_listener_named(listener, config, "")
    }

    /// Like [`Self::with_listener`], looking configuration keys up under
    /// `name` first.
    pub fn with_listener_named(listener: L, config: &Config, name: &str) -> Result<Self, Error> {
        let max_frame_size =
            get_namespaced_usize_or(config, name, "max_frame_size", MAX_MESSAGE_LEN)?;
        if max_frame_size > MAX_MESSAGE_LEN {
            warn!(max_frame_size, "max_frame_size above the wire format limit, clamping");
        }
        Ok(Self::with_parts(
            listener,
            Arc::new(ClientRegistry::new()),
            Arc::new(DeliveryQueue::new()),
            max_frame_size,
        ))
    }

    /// Creates a server from explicitly owned parts.
    ///
    /// The registry and queue may be shared with other components, e.g. a
    /// consumer pool that only needs the queue.
    pub fn with_parts(
        listener: L,
        registry: Arc<ClientRegistry>,
        queue: Arc<DeliveryQueue>,
        max_frame_size: usize,
    ) -> Self {
        Self {
            listener,
            registry,
            queue,
            max_frame_size: max_frame_size.min(MAX_MESSAGE_LEN),
        }
    }
}

// ============================================================================
// Listener Management
// ============================================================================

impl<L: Listener> Server<L> {
    /// Binds the listener and returns the address actually bound (useful
    /// when binding to port 0).
    #[instrument(skip(self, addr))]
    pub fn bind<A: ToSocketAddrs>(&mut self, addr: A) -> Result<SocketAddr, Error> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or(Error::InvalidAddress)?;
        self.listener.bind(addr)
    }

    /// Starts listening on the bound address.
    pub fn listen(&mut self) -> Result<(), Error> {
        self.listener.listen()
    }

    /// Returns the bound address, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    /// Blocks until a connection arrives and returns it as a [`Peer`].
    ///
    /// The peer is not registered; pass it to [`add_client`](Self::add_client).
    pub fn accept(&self) -> Result<Peer, Error> {
        self.listener.accept().map(Peer::new)
    }

    /// Shuts down every registered peer, then the listener.
    ///
    /// Both happen under the registry lock, so no peer can be added between
    /// the two steps. Returns the result of the listener shutdown. Reader
    /// threads observe the end of their streams and exit; [`run`](Self::run)
    /// returns.
    #[instrument(skip(self))]
    pub fn shutdown(&self) -> Result<(), Error> {
        let result = self
            .registry
            .shutdown_all_then(|| self.listener.shutdown());
        if let Err(err) = &result {
            error!(?err, "Error shutting down listener");
        }
        result
    }
}

// ============================================================================
// Client Management
// ============================================================================

impl<L: Listener> Server<L> {
    /// See [`ClientRegistry::add`].
    pub fn add_client(&self, peer: Peer) -> bool {
        self.registry.add(peer)
    }

    /// See [`ClientRegistry::remove`].
    pub fn remove_client(&self, peer: &Peer) -> Result<(), Error> {
        self.registry.remove(peer)
    }

    /// See [`ClientRegistry::contains`].
    pub fn contains(&self, peer: &Peer) -> bool {
        self.registry.contains(peer)
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }
}

// ============================================================================
// Data Operations
// ============================================================================

impl<L: Listener> Server<L> {
    /// Frames `msg` and sends it to `peer`.
    ///
    /// Fails with [`Error::MessageTooLarge`] before writing anything if `msg`
    /// cannot be framed, and with [`Error::PeerNotFound`] if `peer` is not
    /// registered.
    pub fn send(&self, peer: &Peer, msg: &[u8]) -> Result<(), Error> {
        let frame = FrameCodec::encode(msg)?;
        self.registry.send(peer, &frame)
    }

    /// Frames `msg` once and sends it to each of `peers`, best effort.
    ///
    /// Returns the per-peer failures. Only a framing error aborts the call.
    pub fn send_many(&self, peers: &[Peer], msg: &[u8]) -> Result<Vec<DeliveryFailure>, Error> {
        let frame = FrameCodec::encode(msg)?;
        Ok(self.registry.send_many(peers, &frame))
    }

    /// Frames `msg` once and sends it to every registered peer.
    ///
    /// Returns the per-peer failures. See [`ClientRegistry::broadcast`] for
    /// the locking behavior.
    pub fn broadcast(&self, msg: &[u8]) -> Result<Vec<DeliveryFailure>, Error> {
        let frame = FrameCodec::encode(msg)?;
        Ok(self.registry.broadcast(&frame))
    }

    /// Pushes `msg` into the delivery queue.
    pub fn push(&self, msg: Vec<u8>) {
        self.queue.push(msg);
    }

    /// Blocks until a message is available in the delivery queue.
    pub fn pop(&self) -> Vec<u8> {
        self.queue.pop()
    }

    /// Like [`pop`](Self::pop), but gives up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.queue.pop_timeout(timeout)
    }

    pub fn queue(&self) -> &Arc<DeliveryQueue> {
        &self.queue
    }

    /// Creates a decoder configured with this server's frame size limit.
    pub fn new_codec(&self) -> FrameCodec {
        FrameCodec::with_max_frame_size(self.max_frame_size)
    }
}

// ============================================================================
// Connection Loops
// ============================================================================

impl<L: Listener> Server<L> {
    /// Reads from `peer` until its stream ends, queueing every decoded
    /// message in arrival order.
    ///
    /// Blocks the calling thread. When the stream ends, the transport fails,
    /// or the peer violates the framing, only this peer is torn down: its
    /// connection is shut down and it is unregistered if still registered.
    #[instrument(skip(self, peer), fields(id = peer.id(), addr = %peer))]
    pub fn serve_connection(&self, peer: &Peer) {
        let mut codec = self.new_codec();
        let mut decoded = Vec::new();

        loop {
            match peer.connection().receive() {
                Ok(Some(data)) => {
                    let result = codec.decode_into(&data, &mut decoded);
                    for msg in decoded.drain(..) {
                        debug!(len = msg.len(), "Received message");
                        self.queue.push(msg);
                    }
                    if let Err(err) = result {
                        error!(?err, "Error decoding stream, dropping client");
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(?err, "Error receiving from client");
                    break;
                }
            }
        }

        if !self.registry.discard(peer) {
            // Removed by someone else already; make sure it is down.
            if let Err(err) = peer.connection().shutdown() {
                debug!(?err, "Error shutting down unregistered client");
            }
        }
    }
}

impl<L: Listener + 'static> Server<L> {
    /// Runs the accept loop until the listener is shut down.
    ///
    /// Every accepted peer is registered and served by its own thread. A
    /// failed accept is logged and the loop keeps going. Once the listener
    /// is closed, remaining peers are shut down and all reader threads are
    /// joined before returning.
    #[instrument(skip(self))]
    pub fn run(self: &Arc<Self>) {
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        loop {
            match self.accept() {
                Ok(peer) => {
                    self.add_client(peer.clone());
                    let server = Arc::clone(self);
                    let reader_peer = peer.clone();
                    let spawned = thread::Builder::new()
                        .name(format!("peer-{}", peer.id()))
                        .spawn(move || server.serve_connection(&reader_peer));
                    match spawned {
                        Ok(handle) => handles.push(handle),
                        Err(err) => {
                            error!(id = peer.id(), ?err, "Failed to spawn reader thread");
                            self.registry.discard(&peer);
                        }
                    }
                    handles.retain(|handle| !handle.is_finished());
                }
                Err(Error::ListenerClosed) => break,
                Err(err) => {
                    warn!(?err, "Error accepting connection");
                    thread::sleep(ACCEPT_RETRY_DELAY);
                }
            }
        }

        info!("Accept loop finished, waiting for readers");

        // A peer accepted while shutdown was in progress may have missed
        // shutdown_all().
        self.registry.shutdown_all();
        for handle in handles {
            if handle.join().is_err() {
                error!("Reader thread panicked");
            }
        }
    }
}
