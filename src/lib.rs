//! framecomm - message framing, peer bookkeeping, and delivery over TCP
//!
//! framecomm turns a raw byte stream into a stream of messages. It provides a
//! compact length-prefixed wire format that can be decoded from arbitrarily
//! chunked input, a thread-safe registry of connected peers with unicast and
//! broadcast sends, and a blocking queue that hands decoded messages from the
//! per-connection reader threads to any number of consumers.
//!
//! The main pieces are:
//!
//! - [`FrameCodec`]: streaming encoder/decoder for the wire format
//! - [`DeliveryQueue`]: blocking multi-producer, multi-consumer FIFO
//! - [`ClientRegistry`] and [`Peer`]: the set of connected peers
//! - [`Server`]: accept loop and per-connection readers over a [`Listener`]
//! - [`Client`]: connecting side of the same protocol

// Internal-only modules
pub(crate) mod client;
pub(crate) mod codec;
pub(crate) mod config;
pub(crate) mod error;
pub(crate) mod queue;
pub(crate) mod server;
pub(crate) mod transport;

// These are the intended public API
pub use client::{Client, ClientInterface};
pub use codec::{FrameCodec, MAX_MESSAGE_LEN};
pub use error::Error;
pub use queue::DeliveryQueue;
pub use server::{ClientRegistry, DeliveryFailure, Peer, Server};
pub use transport::{Connection, Listener, TcpConnection, TcpListenerTransport};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::client::{Client, ClientInterface};
    pub use crate::codec::{FrameCodec, MAX_MESSAGE_LEN};
    pub use crate::error::Error;
    pub use crate::queue::DeliveryQueue;
    pub use crate::server::{ClientRegistry, DeliveryFailure, Peer, Server};
    pub use crate::transport::{Connection, Listener, TcpConnection, TcpListenerTransport};
}
