//! Line-based TCP Chat Library
//!
//! A minimal multi-user chat service built on tokio: clients connect over
//! TCP, claim a username, and exchange newline-delimited text lines that
//! the server broadcasts to every participant.
//!
//! # Protocol
//! - client -> server, first line: `<username>`
//! - server -> client: `1` (accepted) or `0|<reason>` (rejected, then closed)
//! - client -> server: `<text>` per chat line; an empty line ends the session
//! - server -> client: `<username>: <text>`, `<username> has joined the chat.`,
//!   `<username> has left the chat.`, or an operator notice verbatim
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `Registry` is the single owner of the username -> session map and
//!   performs every broadcast
//! - Each connection has a session task (handshake + receive loop) and a
//!   writer task, so writes to one peer are ordered
//! - Closing a connection cancels its `CancellationToken`, which unblocks
//!   the reader parked on it
//!
//! # Example
//! ```ignore
//! use tcp_chat::{ChatServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let (mut server, mut events) = ChatServer::new(ServerConfig::default());
//!     server.start().await.unwrap();
//!
//!     while let Some(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//! }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod message;
pub mod registry;
pub mod server;
pub mod session;
pub mod types;

// Re-export main types for convenience
pub use client::{ChatClient, ClientEvent};
pub use config::{ClientConfig, ServerConfig, DEFAULT_PORT};
pub use connection::{LineConnection, LineReader, LineWriter, ReadOutcome};
pub use error::{ClientError, ConnectionError, RegistryError, ServerError};
pub use handshake::HandshakeReply;
pub use message::{ChatMessage, Incoming, MessageKind};
pub use registry::{Departure, Registry, RegistryHandle, SessionEntry};
pub use server::{ChatServer, ServerEvent};
pub use session::handle_connection;
pub use types::SessionId;
