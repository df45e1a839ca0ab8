//! Transport layer the server is built on.
//!
//! The server and registry only talk to the byte stream through the
//! [`Connection`] and [`Listener`] traits. [`tcp`] provides the TCP
//! implementation; tests substitute in-memory fakes.

mod tcp;

pub use tcp::{TcpConnection, TcpListenerTransport};

use crate::error::Error;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;

/// One established, bidirectional byte-stream connection.
///
/// Implementations are shared between the registry and the connection's
/// reader thread, so every operation takes `&self`. Reads and writes may run
/// concurrently on different threads.
pub trait Connection: Send + Sync + Debug {
    /// Returns the opaque handle of this connection.
    ///
    /// Handles are unique for the lifetime of the process and are never
    /// reused. Peers compare and order by this value.
    fn id(&self) -> usize;

    /// Returns the remote address, for diagnostics.
    fn peer_addr(&self) -> SocketAddr;

    /// Writes all of `buf`, or fails.
    fn send(&self, buf: &[u8]) -> Result<(), Error>;

    /// Blocks until bytes arrive.
    ///
    /// Returns `Ok(None)` when the stream has ended, either because the
    /// remote side closed it or because [`shutdown`](Self::shutdown) was
    /// called. Chunk boundaries carry no meaning.
    fn receive(&self) -> Result<Option<Vec<u8>>, Error>;

    /// Shuts down both directions. A reader blocked in
    /// [`receive`](Self::receive) observes end of stream or an error.
    fn shutdown(&self) -> Result<(), Error>;
}

/// Accepting side of a transport.
pub trait Listener: Send + Sync {
    /// Binds to `addr` and returns the address actually bound.
    fn bind(&mut self, addr: SocketAddr) -> Result<SocketAddr, Error>;

    /// Starts accepting connections on the bound address.
    fn listen(&mut self) -> Result<(), Error>;

    /// Blocks until a new connection arrives.
    ///
    /// Returns [`Error::ListenerClosed`] once [`shutdown`](Self::shutdown) was
    /// called, including for calls already blocked at that moment.
    fn accept(&self) -> Result<Arc<dyn Connection>, Error>;

    /// Returns the bound address, if any.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Stops accepting connections. Idempotent.
    fn shutdown(&self) -> Result<(), Error>;
}
