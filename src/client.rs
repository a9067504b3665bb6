//! Client session controller
//!
//! Drives one outbound connection through the handshake and then a
//! receive loop on its own task. The presentation layer calls
//! `connect` / `send_message` / `close` and drains `ClientEvent`s.

use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::connection::{LineConnection, LineReader, LineWriter};
use crate::error::ClientError;
use crate::handshake::{self, HandshakeReply};
use crate::message::Incoming;

/// Notifications for the client's presentation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A line from the server, or a rejection reason
    MessageReceived(String),
    /// The connection was lost or closed
    Disconnected,
}

/// An admitted connection
struct Established {
    username: String,
    writer: LineWriter,
    receive_task: JoinHandle<()>,
}

/// Chat client
///
/// Holds at most one connection at a time.
pub struct ChatClient {
    config: ClientConfig,
    events: mpsc::UnboundedSender<ClientEvent>,
    connection: Option<Established>,
}

impl ChatClient {
    /// Create a disconnected client and the receiver for its events
    pub fn new(config: ClientConfig) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let client = Self {
            config,
            events,
            connection: None,
        };
        (client, receiver)
    }

    /// Connect to `addr` and claim `username`
    ///
    /// On rejection the reason is also delivered as a `MessageReceived`
    /// event and the connection is closed.
    pub async fn connect(
        &mut self,
        username: &str,
        addr: impl ToSocketAddrs,
    ) -> Result<(), ClientError> {
        if self.is_connected() {
            return Err(ClientError::AlreadyConnected);
        }

        let stream = TcpStream::connect(addr).await?;
        let (mut reader, writer) =
            LineConnection::new(stream, CancellationToken::new(), self.config.max_line_length)
                .into_split();

        match handshake::authenticate(&mut reader, &writer, username).await {
            Ok(HandshakeReply::Accepted) => {
                info!("Connected as '{}'", username);
                let receive_task =
                    tokio::spawn(receive_loop(reader, writer.clone(), self.events.clone()));
                self.connection = Some(Established {
                    username: username.to_string(),
                    writer,
                    receive_task,
                });
                Ok(())
            }
            Ok(HandshakeReply::Rejected(reason)) => {
                info!("Server rejected '{}': {}", username, reason);
                writer.close();
                let _ = self
                    .events
                    .send(ClientEvent::MessageReceived(reason.clone()));
                Err(ClientError::Rejected(reason))
            }
            Err(e) => {
                warn!("Handshake failed: {}", e);
                writer.close();
                Err(e)
            }
        }
    }

    /// Send one chat line; the server echoes it back to everyone
    pub fn send_message(&self, text: &str) -> Result<(), ClientError> {
        if text.is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        let connection = self.live_connection().ok_or(ClientError::NotConnected)?;
        connection.writer.write_line(text)?;
        Ok(())
    }

    /// End the session gracefully with the end-of-session marker, then close
    pub fn leave(&self) -> Result<(), ClientError> {
        let connection = self.live_connection().ok_or(ClientError::NotConnected)?;
        connection.writer.write_line("")?;
        connection.writer.close();
        Ok(())
    }

    /// Close the connection. Safe to call at any time, any number of times.
    ///
    /// Emits nothing itself; the receive loop reports the disconnect.
    pub fn close(&self) {
        if let Some(connection) = &self.connection {
            connection.writer.close();
        }
    }

    /// Whether an admitted connection is open
    pub fn is_connected(&self) -> bool {
        self.live_connection().is_some()
    }

    /// Username of the open connection
    pub fn username(&self) -> Option<&str> {
        self.live_connection().map(|c| c.username.as_str())
    }

    /// Wait for the receive loop of the current connection to finish
    pub async fn wait_closed(&mut self) {
        if let Some(connection) = self.connection.take() {
            let _ = connection.receive_task.await;
        }
    }

    fn live_connection(&self) -> Option<&Established> {
        self.connection
            .as_ref()
            .filter(|connection| !connection.writer.is_closed())
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// Client receive loop
///
/// Every line becomes a `MessageReceived` event. Only a lost connection
/// raises `Disconnected`; the end-of-session marker closes silently.
async fn receive_loop(
    mut reader: LineReader,
    writer: LineWriter,
    events: mpsc::UnboundedSender<ClientEvent>,
) {
    loop {
        match Incoming::from(reader.read_line().await) {
            Incoming::Chat(line) => {
                let _ = events.send(ClientEvent::MessageReceived(line));
            }
            Incoming::EndOfSession => {
                debug!("Server ended the session");
                writer.close();
                break;
            }
            Incoming::Disconnected(cause) => {
                match cause {
                    Some(e) => warn!("Connection lost: {}", e),
                    None => info!("Disconnected"),
                }
                writer.close();
                let _ = events.send(ClientEvent::Disconnected);
                break;
            }
        }
    }

    debug!("Receive loop ended");
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    use super::*;

    /// A hand-driven server end for one client
    struct FakeServer {
        reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
        writer: tokio::net::tcp::OwnedWriteHalf,
    }

    impl FakeServer {
        async fn recv(&mut self) -> String {
            let mut line = String::new();
            timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
                .await
                .unwrap()
                .unwrap();
            line.trim_end_matches('\n').to_string()
        }

        async fn send(&mut self, line: &str) {
            self.writer
                .write_all(format!("{}\n", line).as_bytes())
                .await
                .unwrap();
        }
    }

    /// Accept one connection, read the identity claim, answer with `reply`
    async fn fake_server(reply: &'static str) -> (SocketAddr, JoinHandle<(String, FakeServer)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, write_half) = stream.into_split();
            let mut server = FakeServer {
                reader: BufReader::new(read_half),
                writer: write_half,
            };
            let username = server.recv().await;
            server.send(reply).await;
            (username, server)
        });
        (addr, task)
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
        timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_connect_and_send() {
        let (addr, server) = fake_server("1").await;
        let (mut client, mut events) = ChatClient::new(ClientConfig::default());

        client.connect("alice", addr).await.unwrap();
        assert!(client.is_connected());
        assert_eq!(client.username(), Some("alice"));

        let (username, mut server) = server.await.unwrap();
        assert_eq!(username, "alice");

        client.send_message("hi").unwrap();
        assert_eq!(server.recv().await, "hi");

        server.send("alice: hi").await;
        assert_eq!(
            next_event(&mut events).await,
            ClientEvent::MessageReceived("alice: hi".to_string())
        );
    }

    #[tokio::test]
    async fn test_rejection_surfaces_reason() {
        let (addr, _server) = fake_server("0|This username is already connected.").await;
        let (mut client, mut events) = ChatClient::new(ClientConfig::default());

        let result = client.connect("alice", addr).await;

        assert!(matches!(result, Err(ClientError::Rejected(ref r)) if r == "This username is already connected."));
        assert!(!client.is_connected());
        assert_eq!(
            next_event(&mut events).await,
            ClientEvent::MessageReceived("This username is already connected.".to_string())
        );
    }

    #[tokio::test]
    async fn test_server_hangup_raises_disconnected() {
        let (addr, server) = fake_server("1").await;
        let (mut client, mut events) = ChatClient::new(ClientConfig::default());
        client.connect("alice", addr).await.unwrap();

        drop(server.await.unwrap());

        assert_eq!(next_event(&mut events).await, ClientEvent::Disconnected);
        assert!(!client.is_connected());
        assert!(matches!(client.send_message("hi"), Err(ClientError::NotConnected)));
    }

    #[tokio::test]
    async fn test_end_marker_closes_silently() {
        let (addr, server) = fake_server("1").await;
        let (mut client, mut events) = ChatClient::new(ClientConfig::default());
        client.connect("alice", addr).await.unwrap();

        let (_, mut server) = server.await.unwrap();
        server.send("").await;
        client.wait_closed().await;

        assert!(!client.is_connected());
        assert!(timeout(Duration::from_millis(200), events.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_close_twice_then_disconnected_once() {
        let (addr, _server) = fake_server("1").await;
        let (mut client, mut events) = ChatClient::new(ClientConfig::default());
        client.connect("alice", addr).await.unwrap();

        client.close();
        client.close();

        assert!(!client.is_connected());
        assert_eq!(next_event(&mut events).await, ClientEvent::Disconnected);
        client.wait_closed().await;
        assert!(timeout(Duration::from_millis(200), events.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_leave_sends_end_marker() {
        let (addr, server) = fake_server("1").await;
        let (mut client, _events) = ChatClient::new(ClientConfig::default());
        client.connect("alice", addr).await.unwrap();
        let (_, mut server) = server.await.unwrap();

        client.leave().unwrap();

        assert_eq!(server.recv().await, "");
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let (client, _events) = ChatClient::new(ClientConfig::default());
        assert!(matches!(client.send_message("hi"), Err(ClientError::NotConnected)));
        assert!(matches!(client.send_message(""), Err(ClientError::EmptyMessage)));
        assert!(matches!(client.leave(), Err(ClientError::NotConnected)));
        client.close();
    }

    #[tokio::test]
    async fn test_empty_reply_is_protocol_error() {
        let (addr, _server) = fake_server("").await;
        let (mut client, _events) = ChatClient::new(ClientConfig::default());

        let result = client.connect("alice", addr).await;

        assert!(matches!(result, Err(ClientError::Protocol(_))));
        assert!(!client.is_connected());
    }
}
