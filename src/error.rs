//! Error types for the chat service
//!
//! One enum per layer: the line connection, the session registry,
//! the server lifecycle and the client controller.
//! Uses thiserror for ergonomic error definitions.

use std::net::SocketAddr;

use thiserror::Error;
use tokio_util::codec::AnyDelimiterCodecError;

/// Line connection errors
///
/// Any of these ends the session that owns the connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The connection was already closed (locally or by the peer)
    #[error("Connection closed")]
    Closed,

    /// IO error on the underlying transport
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent a line longer than the configured limit
    #[error("Line exceeds maximum length")]
    LineTooLong,

    /// The peer stopped reading and its outbound queue filled up
    #[error("Outbound queue full")]
    QueueFull,
}

impl From<AnyDelimiterCodecError> for ConnectionError {
    fn from(err: AnyDelimiterCodecError) -> Self {
        match err {
            AnyDelimiterCodecError::MaxChunkLengthExceeded => ConnectionError::LineTooLong,
            AnyDelimiterCodecError::Io(e) => ConnectionError::Io(e),
        }
    }
}

/// Session registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Another session already holds this username
    #[error("Username already connected: {0}")]
    UsernameTaken(String),

    /// The registry actor is gone (server stopped)
    #[error("Registry unavailable")]
    Unavailable,

    /// The session's connection died before it could be admitted
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Server lifecycle errors
#[derive(Debug, Error)]
pub enum ServerError {
    /// Could not bind the listening socket
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// `start` called while already listening
    #[error("Server is already running")]
    AlreadyRunning,

    /// Operation requires a running server
    #[error("Server is not running")]
    NotRunning,

    /// Operator notices must carry text
    #[error("Notice text is empty")]
    EmptyNotice,

    /// Registry actor failure
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Client controller errors
///
/// None of these are raised from the receive loop: faults there
/// surface as a `Disconnected` event instead.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport-level connect failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Fault on an open connection
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// The server refused the handshake
    #[error("Rejected by server: {0}")]
    Rejected(String),

    /// Malformed or missing handshake reply
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// No established connection
    #[error("Not connected")]
    NotConnected,

    /// `connect` called on a live session
    #[error("Already connected")]
    AlreadyConnected,

    /// An empty line would end the session on the server
    #[error("Message is empty")]
    EmptyMessage,
}
