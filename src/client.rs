//! Client side of the framed protocol.

use crate::codec::{FrameCodec, MAX_MESSAGE_LEN};
use crate::config::get_namespaced_usize_or;
use crate::error::Error;
use crate::transport::{Connection, TcpConnection};

use ::config::Config;
use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Framed TCP connection to a server.
///
/// [`recv`](Self::recv) needs `&mut self` because it owns the decoder. To send
/// from other threads while one thread is blocked in `recv`, obtain a
/// [`ClientInterface`].
///
/// # Configuration Keys
///
/// - `max_frame_size`: largest inbound message accepted (defaults to
///   [`MAX_MESSAGE_LEN`])
/// - Plus the connection keys of [`TcpConnection::connect`]
#[derive(Debug)]
pub struct Client {
    conn: Arc<TcpConnection>,
    codec: FrameCodec,
    inbox: VecDeque<Vec<u8>>,
}

/// Thread-safe handle for sending through a [`Client`].
///
/// Cheap to clone; every clone writes to the same connection.
#[derive(Debug, Clone)]
pub struct ClientInterface {
    conn: Arc<TcpConnection>,
}

// ============================================================================
// Constructors
// ============================================================================

impl Client {
    /// Connects to a server at `addr`.
    pub fn connect<A: ToSocketAddrs>(addr: A, config: &Config) -> Result<Self, Error> {
        Self::connect_named(addr, config, "")
    }

    /// Connects to a server at `addr` with configuration namespacing.
    pub fn connect_named<A: ToSocketAddrs>(
        addr: A,
        config: &Config,
        name: &str,
    ) -> Result<Self, Error> {
        let max_frame_size =
            get_namespaced_usize_or(config, name, "max_frame_size", MAX_MESSAGE_LEN)?;
        let conn = TcpConnection::connect_named(addr, config, name)?;
        Ok(Self {
            conn: Arc::new(conn),
            codec: FrameCodec::with_max_frame_size(max_frame_size),
            inbox: VecDeque::new(),
        })
    }
}

// ============================================================================
// Public Methods
// ============================================================================

impl Client {
    /// Frames `msg` and writes it to the server.
    #[instrument(skip(self, msg), fields(id = self.conn.id(), len = msg.len()))]
    pub fn send(&self, msg: &[u8]) -> Result<(), Error> {
        send_framed(&self.conn, msg)
    }

    /// Blocks until one whole message has arrived.
    ///
    /// Returns `Ok(None)` once the server closed the connection and every
    /// message received before that was returned.
    pub fn recv(&mut self) -> Result<Option<Vec<u8>>, Error> {
        loop {
            if let Some(msg) = self.inbox.pop_front() {
                return Ok(Some(msg));
            }
            if self.codec.is_corrupted() {
                return Err(Error::StreamCorrupted);
            }

            let Some(data) = self.conn.receive()? else {
                return Ok(None);
            };

            let mut decoded = Vec::new();
            let result = self.codec.decode_into(&data, &mut decoded);
            self.inbox.extend(decoded);
            if let Err(err) = result {
                // Hand out what was decoded before the violation first
                if self.inbox.is_empty() {
                    return Err(err);
                }
                debug!(?err, "Decode error after buffered messages");
            }
        }
    }

    /// Shuts the connection down. A thread blocked in [`recv`](Self::recv)
    /// returns.
    pub fn shutdown(&self) -> Result<(), Error> {
        self.conn.shutdown()
    }

    /// Gets a [`ClientInterface`] for sending from other threads.
    pub fn get_client_interface(&self) -> ClientInterface {
        ClientInterface {
            conn: Arc::clone(&self.conn),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.conn.local_addr()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.conn.peer_addr()
    }
}

impl ClientInterface {
    /// Frames `msg` and writes it to the server.
    pub fn send(&self, msg: &[u8]) -> Result<(), Error> {
        send_framed(&self.conn, msg)
    }

    /// Shuts the connection down.
    pub fn shutdown(&self) -> Result<(), Error> {
        self.conn.shutdown()
    }
}

fn send_framed(conn: &TcpConnection, msg: &[u8]) -> Result<(), Error> {
    let frame = FrameCodec::encode(msg)?;
    conn.send(&frame)
}
