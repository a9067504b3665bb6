//! Session registry actor
//!
//! Owns the username -> session map and is the broadcast dispatcher.
//! Every insert, remove, snapshot and broadcast is a command processed in
//! order by a single task, so no two session tasks ever touch the map at
//! the same time and a duplicate username can never slip in.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::connection::LineWriter;
use crate::error::{ConnectionError, RegistryError};
use crate::handshake::HandshakeReply;
use crate::message::ChatMessage;
use crate::server::ServerEvent;
use crate::types::SessionId;

/// Channel buffer size for registry commands
const COMMAND_BUFFER_SIZE: usize = 256;

/// How a session left the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    /// Peer sent the end-of-session marker; no announcement
    Graceful,
    /// Connection closed or faulted; announced to everyone left
    Lost,
}

/// A registered session
///
/// Holds the username and the write side of the session's connection.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub id: SessionId,
    pub username: String,
    pub writer: LineWriter,
}

impl SessionEntry {
    pub fn new(id: SessionId, username: String, writer: LineWriter) -> Self {
        Self {
            id,
            username,
            writer,
        }
    }

    /// Queue a line for this session
    pub fn send(&self, line: &str) -> Result<(), ConnectionError> {
        self.writer.write_line(line)
    }
}

/// Commands sent to the registry actor
#[derive(Debug)]
pub enum RegistryCommand {
    /// Admit a session if its username is free
    Register {
        entry: SessionEntry,
        reply: oneshot::Sender<Result<(), RegistryError>>,
    },
    /// Drop a session; replies whether it was present
    Remove {
        username: String,
        session_id: SessionId,
        departure: Departure,
        reply: oneshot::Sender<bool>,
    },
    /// Send a message to every registered session
    Broadcast { message: ChatMessage },
    /// Copy of the current entries
    Snapshot {
        reply: oneshot::Sender<Vec<SessionEntry>>,
    },
    /// Close and forget every session; replies with the count
    CloseAll { reply: oneshot::Sender<usize> },
}

/// The registry actor
pub struct Registry {
    /// Registered sessions: username -> entry
    sessions: HashMap<String, SessionEntry>,
    /// Command receiver channel
    receiver: mpsc::Receiver<RegistryCommand>,
    /// Server event log
    events: mpsc::UnboundedSender<ServerEvent>,
}

impl Registry {
    /// Create a registry actor and the handle used to talk to it
    pub fn new(events: mpsc::UnboundedSender<ServerEvent>) -> (Self, RegistryHandle) {
        let (sender, receiver) = mpsc::channel(COMMAND_BUFFER_SIZE);
        let registry = Self {
            sessions: HashMap::new(),
            receiver,
            events,
        };
        (registry, RegistryHandle { sender })
    }

    /// Create the actor and run it on its own task
    pub fn spawn(events: mpsc::UnboundedSender<ServerEvent>) -> RegistryHandle {
        let (registry, handle) = Self::new(events);
        tokio::spawn(registry.run());
        handle
    }

    /// Run the registry event loop
    ///
    /// Processes commands until every handle has been dropped.
    pub async fn run(mut self) {
        debug!("Registry started");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        debug!("Registry stopped");
    }

    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Register { entry, reply } => {
                let _ = reply.send(self.handle_register(entry));
            }
            RegistryCommand::Remove {
                username,
                session_id,
                departure,
                reply,
            } => {
                let _ = reply.send(self.handle_remove(&username, session_id, departure));
            }
            RegistryCommand::Broadcast { message } => {
                self.broadcast(&message);
            }
            RegistryCommand::Snapshot { reply } => {
                let _ = reply.send(self.sessions.values().cloned().collect());
            }
            RegistryCommand::CloseAll { reply } => {
                let _ = reply.send(self.handle_close_all());
            }
        }
    }

    /// Accept the session, record it, then announce it
    ///
    /// The acceptance line is queued here, before any broadcast can reach
    /// the new session.
    fn handle_register(&mut self, entry: SessionEntry) -> Result<(), RegistryError> {
        if self.sessions.contains_key(&entry.username) {
            debug!("Username '{}' already registered", entry.username);
            return Err(RegistryError::UsernameTaken(entry.username));
        }

        entry.send(&HandshakeReply::Accepted.to_line())?;

        let username = entry.username.clone();
        info!("Session {} registered as '{}'", entry.id, username);
        self.sessions.insert(username.clone(), entry);
        debug!("Total sessions: {}", self.sessions.len());

        self.broadcast(&ChatMessage::joined(username));
        Ok(())
    }

    fn handle_remove(&mut self, username: &str, session_id: SessionId, departure: Departure) -> bool {
        // A later session may own the name by now
        let owned = self
            .sessions
            .get(username)
            .is_some_and(|entry| entry.id == session_id);
        if !owned {
            return false;
        }

        self.sessions.remove(username);
        info!("Session {} ('{}') removed: {:?}", session_id, username, departure);
        debug!("Total sessions: {}", self.sessions.len());

        if departure == Departure::Lost {
            self.broadcast(&ChatMessage::left(username));
        }
        true
    }

    fn handle_close_all(&mut self) -> usize {
        let count = self.sessions.len();
        for entry in self.sessions.values() {
            entry.writer.close();
        }
        self.sessions.clear();
        info!("Closed {} sessions", count);
        count
    }

    /// Write one message to every registered session
    ///
    /// A failed write is skipped; that session's receive loop will see the
    /// fault and remove it.
    fn broadcast(&self, message: &ChatMessage) {
        let line = message.to_line();
        if message.is_presence() {
            info!("{}", line);
        }
        debug!("Broadcast to {} sessions: {}", self.sessions.len(), line);

        let _ = self.events.send(ServerEvent::Log(line.clone()));

        for entry in self.sessions.values() {
            if let Err(e) = entry.send(&line) {
                debug!("Skipping session {}: {}", entry.id, e);
            }
        }
    }
}

/// Handle to the registry actor
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    /// Atomically check the username and insert the session
    ///
    /// On success the session has been sent the acceptance line and
    /// everyone has been sent the join announcement.
    pub async fn try_register(
        &self,
        username: String,
        session_id: SessionId,
        writer: LineWriter,
    ) -> Result<(), RegistryError> {
        let (reply, rx) = oneshot::channel();
        let entry = SessionEntry::new(session_id, username, writer);
        self.send(RegistryCommand::Register { entry, reply }).await?;
        rx.await.map_err(|_| RegistryError::Unavailable)?
    }

    /// Remove a session; no-op if it is not (or no longer) registered
    ///
    /// Returns whether an entry was removed.
    pub async fn remove(&self, username: &str, session_id: SessionId, departure: Departure) -> bool {
        let (reply, rx) = oneshot::channel();
        let cmd = RegistryCommand::Remove {
            username: username.to_string(),
            session_id,
            departure,
            reply,
        };
        if self.send(cmd).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Send a message to every registered session
    pub async fn broadcast(&self, message: ChatMessage) -> Result<(), RegistryError> {
        self.send(RegistryCommand::Broadcast { message }).await
    }

    /// Current registered sessions
    pub async fn snapshot(&self) -> Result<Vec<SessionEntry>, RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.send(RegistryCommand::Snapshot { reply }).await?;
        rx.await.map_err(|_| RegistryError::Unavailable)
    }

    /// Close every registered connection and empty the registry
    pub async fn close_all(&self) -> Result<usize, RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.send(RegistryCommand::CloseAll { reply }).await?;
        rx.await.map_err(|_| RegistryError::Unavailable)
    }

    async fn send(&self, cmd: RegistryCommand) -> Result<(), RegistryError> {
        self.sender
            .send(cmd)
            .await
            .map_err(|_| RegistryError::Unavailable)
    }
}
