//! Server-side session handler
//!
//! Drives one accepted connection: handshake, registration, then the
//! receive loop relaying every chat line through the registry until the
//! peer ends the session or the connection is lost.

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{LineConnection, LineReader};
use crate::error::RegistryError;
use crate::handshake::{self, HandshakeReply};
use crate::message::{ChatMessage, Incoming};
use crate::registry::{Departure, RegistryHandle};
use crate::types::SessionId;

/// Handle a new TCP connection
///
/// Never fails: every fault ends the session and is handled here.
/// `shutdown` is this connection's close signal.
pub async fn handle_connection(
    stream: TcpStream,
    registry: RegistryHandle,
    shutdown: CancellationToken,
    max_line_length: usize,
) {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let session_id = SessionId::new();
    debug!("Session {} opened from {}", session_id, peer_addr);

    let (mut reader, writer) = LineConnection::new(stream, shutdown, max_line_length).into_split();

    let Some(username) = handshake::read_identity(&mut reader).await else {
        writer.close();
        return;
    };

    match registry
        .try_register(username.clone(), session_id, writer.clone())
        .await
    {
        Ok(()) => {
            info!("'{}' connected from {} (session {})", username, peer_addr, session_id);
        }
        Err(RegistryError::UsernameTaken(_)) => {
            info!("Rejected '{}' from {}: username taken", username, peer_addr);
            let _ = writer.write_line(HandshakeReply::username_taken().to_line());
            writer.close();
            return;
        }
        Err(e) => {
            warn!("Could not admit '{}' from {}: {}", username, peer_addr, e);
            writer.close();
            return;
        }
    }

    let departure = receive_loop(&mut reader, &username, session_id, &registry).await;
    registry.remove(&username, session_id, departure).await;
    writer.close();

    debug!("Session {} closed", session_id);
}

/// Relay chat lines until the session ends
async fn receive_loop(
    reader: &mut LineReader,
    username: &str,
    session_id: SessionId,
    registry: &RegistryHandle,
) -> Departure {
    loop {
        match Incoming::from(reader.read_line().await) {
            Incoming::Chat(text) => {
                debug!("Session {} sent {} bytes", session_id, text.len());
                if registry
                    .broadcast(ChatMessage::chat(username, text))
                    .await
                    .is_err()
                {
                    debug!("Registry gone, ending session {}", session_id);
                    return Departure::Lost;
                }
            }
            Incoming::EndOfSession => {
                info!("'{}' ended the session", username);
                return Departure::Graceful;
            }
            Incoming::Disconnected(None) => {
                info!("'{}' disconnected", username);
                return Departure::Lost;
            }
            Incoming::Disconnected(Some(e)) => {
                warn!("'{}' lost: {}", username, e);
                return Departure::Lost;
            }
        }
    }
}
