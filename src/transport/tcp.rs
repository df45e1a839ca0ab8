//! TCP transport implementation.
//!
//! Connections use blocking std sockets: each one is read by its own thread
//! and written from any thread. The listener is non-blocking and parks
//! `accept()` on a mio poll together with a waker, so that
//! [`TcpListenerTransport::shutdown`] can release a thread stuck in accept.

use super::{Connection, Listener};
use crate::config::{get_namespaced_bool_or, get_namespaced_usize_or};
use crate::error::Error;
use ::config::Config;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, instrument, trace, warn};

// Internal constants for connection management
const LISTENER_ID: usize = 1;
const WAKE_ID: usize = 2;
const CONNECTION_ID_RANGE_START: usize = 1000;
const DEFAULT_MAX_READ_SIZE: usize = 1024;
const DEFAULT_POLL_CAPACITY: usize = 16;

// Shared by every listener and outgoing connection in the process, so that
// handles stay unique and are never handed out twice.
static NEXT_CONNECTION_ID: AtomicUsize = AtomicUsize::new(CONNECTION_ID_RANGE_START);

fn next_connection_id() -> usize {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

// Per-stream settings read from configuration
#[derive(Debug, Clone, Copy)]
struct StreamSettings {
    max_read_size: usize,
    nodelay: bool,
}

impl StreamSettings {
    fn from_config(config: &Config, name: &str) -> Result<Self, Error> {
        let max_read_size =
            get_namespaced_usize_or(config, name, "max_read_size", DEFAULT_MAX_READ_SIZE)?.max(1);
        let nodelay = get_namespaced_bool_or(config, name, "nodelay", true)?;
        Ok(Self {
            max_read_size,
            nodelay,
        })
    }
}

// ============================================================================
// TcpConnection
// ============================================================================

/// A connected TCP stream.
///
/// Obtained from [`TcpListenerTransport`] on the server side or from
/// [`TcpConnection::connect`] on the client side.
#[derive(Debug)]
pub struct TcpConnection {
    id: usize,
    stream: TcpStream,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    max_read_size: usize,
}

impl TcpConnection {
    /// Connects to `addr`, blocking until the connection is established.
    ///
    /// # Configuration Keys
    ///
    /// - `max_read_size`: receive buffer size per read (default 1024)
    /// - `nodelay`: set `TCP_NODELAY` (default `true`)
    pub fn connect<A: ToSocketAddrs>(addr: A, config: &Config) -> Result<Self, Error> {
        Self::connect_named(addr, config, "")
    }

    /// Like [`Self::connect`], looking configuration keys up under `name`
    /// first.
    #[instrument(skip(addr, config))]
    pub fn connect_named<A: ToSocketAddrs>(
        addr: A,
        config: &Config,
        name: &str,
    ) -> Result<Self, Error> {
        let peer_addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or(Error::InvalidAddress)?;
        let settings = StreamSettings::from_config(config, name)?;
        let stream = TcpStream::connect(peer_addr)?;
        let conn = Self::from_stream(stream, settings)?;
        info!(id = conn.id, local_addr = %conn.local_addr, %peer_addr, "Connected");
        Ok(conn)
    }

    fn from_stream(stream: TcpStream, settings: StreamSettings) -> Result<Self, Error> {
        stream.set_nodelay(settings.nodelay)?;
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        Ok(Self {
            id: next_connection_id(),
            stream,
            local_addr,
            peer_addr,
            max_read_size: settings.max_read_size,
        })
    }

    /// Returns the local address of this connection.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Connection for TcpConnection {
    fn id(&self) -> usize {
        self.id
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn send(&self, buf: &[u8]) -> Result<(), Error> {
        let local_addr = &self.local_addr;
        let peer_addr = &self.peer_addr;
        match (&self.stream).write_all(buf) {
            Ok(()) => {
                trace!(id = self.id, len = buf.len(), %local_addr, %peer_addr, "Wrote to socket");
                Ok(())
            }
            Err(err) => {
                if err.kind() == ErrorKind::BrokenPipe {
                    warn!(id = self.id, %local_addr, %peer_addr, "Broken pipe");
                } else if err.kind() == ErrorKind::ConnectionReset {
                    warn!(id = self.id, %local_addr, %peer_addr, "Connection reset");
                } else {
                    error!(id = self.id, %local_addr, %peer_addr, ?err, "Error writing to socket");
                }
                Err(err.into())
            }
        }
    }

    fn receive(&self) -> Result<Option<Vec<u8>>, Error> {
        let local_addr = &self.local_addr;
        let peer_addr = &self.peer_addr;
        let mut recv_buf = vec![0u8; self.max_read_size];

        loop {
            match (&self.stream).read(&mut recv_buf) {
                Ok(0) => {
                    info!(id = self.id, %local_addr, %peer_addr, "Connection closed");
                    return Ok(None);
                }
                Ok(sz) => {
                    trace!(id = self.id, len = sz, %local_addr, %peer_addr, "Read data from socket");
                    recv_buf.truncate(sz);
                    return Ok(Some(recv_buf));
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    if err.kind() == ErrorKind::ConnectionReset {
                        warn!(id = self.id, %local_addr, %peer_addr, "Connection reset");
                    } else {
                        error!(id = self.id, %local_addr, %peer_addr, ?err, "Error reading from socket");
                    }
                    return Err(err.into());
                }
            }
        }
    }

    fn shutdown(&self) -> Result<(), Error> {
        let local_addr = &self.local_addr;
        let peer_addr = &self.peer_addr;
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => {
                info!(id = self.id, %local_addr, %peer_addr, "Shut down connection");
                Ok(())
            }
            // Already torn down by the other side
            Err(err) if err.kind() == ErrorKind::NotConnected => {
                debug!(id = self.id, %local_addr, %peer_addr, "Connection already shut down");
                Ok(())
            }
            Err(err) => {
                warn!(id = self.id, %local_addr, %peer_addr, ?err, "Error shutting down connection");
                Err(err.into())
            }
        }
    }
}

// ============================================================================
// TcpListenerTransport
// ============================================================================

/// TCP listener producing [`TcpConnection`]s.
///
/// [`shutdown`](Listener::shutdown) closes the listening socket, so later
/// connection attempts are refused by the OS instead of queueing in the
/// backlog.
///
/// # Configuration Keys
///
/// - `max_read_size`: receive buffer size for accepted connections (default 1024)
/// - `nodelay`: set `TCP_NODELAY` on accepted connections (default `true`)
/// - `poll_capacity`: event capacity of the accept poll (default 16)
#[derive(Debug)]
pub struct TcpListenerTransport {
    listener: Mutex<Option<TcpListener>>,
    listening: bool,
    closed: AtomicBool,
    poll: Mutex<Poll>,
    registry: Registry,
    poll_capacity: usize,
    waker: Waker,
    settings: StreamSettings,
}

impl TcpListenerTransport {
    /// Creates an unbound listener.
    pub fn new(config: &Config) -> Result<Self, Error> {
        Self::new_named(config, "")
    }

    /// Creates an unbound listener, looking configuration keys up under
    /// `name` first.
    pub fn new_named(config: &Config, name: &str) -> Result<Self, Error> {
        let poll_capacity =
            get_namespaced_usize_or(config, name, "poll_capacity", DEFAULT_POLL_CAPACITY)?.max(1);
        let settings = StreamSettings::from_config(config, name)?;

        let poll = Poll::new()?;
        // Lets shutdown() deregister while another thread sits in poll()
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), Token(WAKE_ID))?;

        Ok(Self {
            listener: Mutex::new(None),
            listening: false,
            closed: AtomicBool::new(false),
            poll: Mutex::new(poll),
            registry,
            poll_capacity,
            waker,
            settings,
        })
    }

    fn lock_listener(&self) -> MutexGuard<'_, Option<TcpListener>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Listener for TcpListenerTransport {
    #[instrument(skip(self))]
    fn bind(&mut self, addr: SocketAddr) -> Result<SocketAddr, Error> {
        if *self.closed.get_mut() {
            return Err(Error::ListenerClosed);
        }

        // std binds and listens in one step; accept stays disarmed until
        // listen() registers the socket with the poll.
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "Bound listener");
        *self.listener.get_mut().unwrap_or_else(PoisonError::into_inner) = Some(listener);
        Ok(local_addr)
    }

    #[instrument(skip(self))]
    fn listen(&mut self) -> Result<(), Error> {
        let listener = self
            .listener
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .ok_or(Error::NotBound)?;
        if self.listening {
            return Ok(());
        }

        let fd = listener.as_raw_fd();
        self.registry
            .register(&mut SourceFd(&fd), Token(LISTENER_ID), Interest::READABLE)?;
        self.listening = true;

        let local_addr = listener.local_addr()?;
        info!(%local_addr, "Listening for connections");
        Ok(())
    }

    #[instrument(skip(self))]
    fn accept(&self) -> Result<Arc<dyn Connection>, Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ListenerClosed);
        }
        if self.lock_listener().is_none() {
            return Err(Error::NotBound);
        }
        if !self.listening {
            return Err(Error::NotListening);
        }

        // One thread waits on the poll at a time; others queue on the lock.
        let mut poll = self.poll.lock().unwrap_or_else(PoisonError::into_inner);
        let mut events = Events::with_capacity(self.poll_capacity);

        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::ListenerClosed);
            }

            // The socket lock is only held for the non-blocking accept, never
            // across poll(), so shutdown() can always take the socket away.
            let accepted = {
                let guard = self.lock_listener();
                let Some(listener) = guard.as_ref() else {
                    return Err(Error::ListenerClosed);
                };
                listener
                    .accept()
                    .map_err(|err| (err, listener.local_addr().ok()))
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    // Some platforms let accepted sockets inherit O_NONBLOCK
                    stream.set_nonblocking(false)?;
                    let conn = TcpConnection::from_stream(stream, self.settings)?;
                    info!(id = conn.id, local_addr = %conn.local_addr, %peer_addr, "Accepted connection");
                    return Ok(Arc::new(conn));
                }
                Err((err, _)) if err.kind() == ErrorKind::WouldBlock => {
                    // Readiness is edge-triggered, which is fine because we
                    // only wait after accept() drained the backlog.
                    match poll.poll(&mut events, None) {
                        Ok(()) => {}
                        Err(err) if err.kind() == ErrorKind::Interrupted => {}
                        Err(err) => {
                            error!(?err, "Error polling listener");
                            return Err(err.into());
                        }
                    }
                }
                Err((err, _)) if err.kind() == ErrorKind::Interrupted => continue,
                Err((err, local_addr)) => {
                    if matches!(
                        err.kind(),
                        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset
                    ) {
                        warn!(?err, ?local_addr, "Transient accept error");
                    } else {
                        error!(?err, ?local_addr, "Error accepting connection");
                    }
                    return Err(err.into());
                }
            }
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.lock_listener()
            .as_ref()
            .and_then(|l| l.local_addr().ok())
    }

    /// Closes the listening socket and releases every blocked `accept`.
    #[instrument(skip(self))]
    fn shutdown(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let listener = self.lock_listener().take();
        if let Some(listener) = listener {
            let local_addr = listener.local_addr().ok();
            if self.listening {
                let fd = listener.as_raw_fd();
                if let Err(err) = self.registry.deregister(&mut SourceFd(&fd)) {
                    warn!(?err, ?local_addr, "Error deregistering listener");
                }
            }
            // Dropping closes the socket; new connects are refused from here on
            drop(listener);
            info!(?local_addr, "Shut down listener");
        }

        self.waker.wake()?;
        Ok(())
    }
}
