//! Chat server lifecycle
//!
//! Binds the listener, runs the accept loop and the registry actor, and
//! tears everything down again on `stop`. The presentation layer drains
//! `ServerEvent`s from the channel returned by `ChatServer::new`.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::message::ChatMessage;
use crate::registry::{Registry, RegistryHandle};
use crate::session::handle_connection;

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Notifications for the server's presentation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A line for the event log: every broadcast, plus listener faults
    Log(String),
}

/// State that only exists while listening
struct Running {
    registry: RegistryHandle,
    shutdown: CancellationToken,
    accept_task: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// The chat server
pub struct ChatServer {
    config: ServerConfig,
    events: mpsc::UnboundedSender<ServerEvent>,
    running: Option<Running>,
}

impl ChatServer {
    /// Create a stopped server and the receiver for its event log
    pub fn new(config: ServerConfig) -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let server = Self {
            config,
            events,
            running: None,
        };
        (server, receiver)
    }

    /// Start listening for connections
    ///
    /// Returns the bound address (useful when binding port 0).
    pub async fn start(&mut self) -> Result<SocketAddr, ServerError> {
        if self.running.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let addr = self.config.bind_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let registry = Registry::spawn(self.events.clone());
        let shutdown = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            registry.clone(),
            shutdown.clone(),
            self.events.clone(),
            self.config.max_line_length,
        ));

        info!("Chat server listening on {}", local_addr);

        self.running = Some(Running {
            registry,
            shutdown,
            accept_task,
            local_addr,
        });
        Ok(local_addr)
    }

    /// Stop listening and close every connection. No-op when stopped.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        // Registered sessions go first so their loops find the registry
        // already empty and announce nothing.
        match running.registry.close_all().await {
            Ok(count) => debug!("Closed {} sessions", count),
            Err(e) => debug!("Registry already gone: {}", e),
        }

        // Closes the listener and any connection still in its handshake
        running.shutdown.cancel();
        let _ = running.accept_task.await;

        info!("Chat server stopped");
    }

    /// Whether the server is listening
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Bound address while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// Broadcast an operator notice to every participant
    pub async fn send_notice(&self, text: &str) -> Result<(), ServerError> {
        let running = self.running.as_ref().ok_or(ServerError::NotRunning)?;
        if text.is_empty() {
            return Err(ServerError::EmptyNotice);
        }
        running
            .registry
            .broadcast(ChatMessage::notice(text))
            .await?;
        Ok(())
    }

    /// Usernames currently registered, sorted
    pub async fn users(&self) -> Result<Vec<String>, ServerError> {
        let running = self.running.as_ref().ok_or(ServerError::NotRunning)?;
        let mut users: Vec<String> = running
            .registry
            .snapshot()
            .await?
            .into_iter()
            .map(|entry| entry.username)
            .collect();
        users.sort();
        Ok(users)
    }
}

impl Drop for ChatServer {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.shutdown.cancel();
        }
    }
}

/// Accept connections until shutdown, one session task each
async fn accept_loop(
    listener: TcpListener,
    registry: RegistryHandle,
    shutdown: CancellationToken,
    events: mpsc::UnboundedSender<ServerEvent>,
    max_line_length: usize,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("New connection from {}", addr);
                    tokio::spawn(handle_connection(
                        stream,
                        registry.clone(),
                        shutdown.child_token(),
                        max_line_length,
                    ));
                }
                Err(e) => {
                    report_accept_fault(&events, &e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }

    debug!("Accept loop ended");
}

/// Log a failed accept and mirror it onto the event log
fn report_accept_fault(events: &mpsc::UnboundedSender<ServerEvent>, err: &std::io::Error) {
    error!("Failed to accept connection: {}", err);
    let _ = events.send(ServerEvent::Log(format!(
        "Failed to accept connection: {}",
        err
    )));
}
