use thiserror::Error;

/// The error type for framecomm operations.
///
/// Transport failures, registry bookkeeping mistakes, and framing violations
/// all surface through this enum. Connection-scoped errors are meant to tear
/// down only the connection they came from; the registry, the delivery queue,
/// and every other peer stay usable.
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // I/O and Networking Errors
    // ============================================================================

    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The provided socket address could not be parsed or resolved.
    #[error("Invalid socket address")]
    InvalidAddress,

    /// `listen()` or `accept()` was called before `bind()`.
    #[error("Listener is not bound")]
    NotBound,

    /// `accept()` was called before `listen()`.
    #[error("Listener is not listening")]
    NotListening,

    /// The listener was shut down. Returned by every `accept()` afterwards.
    #[error("Listener closed")]
    ListenerClosed,

    // ============================================================================
    // Registry Errors
    // ============================================================================

    /// Attempted to send to or remove a peer that is not registered.
    #[error("Peer {id} not found")]
    PeerNotFound {
        /// The connection handle of the unknown peer.
        id: usize,
    },

    // ============================================================================
    // Framing Errors
    // ============================================================================

    /// The message is longer than the wire format can describe.
    ///
    /// Nothing is written when this is returned.
    #[error("Message of {len} bytes exceeds the maximum of {max} bytes")]
    MessageTooLarge { len: usize, max: usize },

    /// An incoming frame declared a length above the decoder's limit.
    ///
    /// The decoder is corrupted from this point on.
    #[error("Incoming frame of {len} bytes exceeds the limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    /// The decoder hit a protocol violation earlier and cannot find frame
    /// boundaries anymore.
    #[error("Stream corrupted")]
    StreamCorrupted,

    // ============================================================================
    // Configuration Errors
    // ============================================================================

    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}
