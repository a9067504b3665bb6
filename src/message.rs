//! Message protocol definitions
//!
//! The wire protocol is plain newline-terminated text. This module holds the
//! in-memory chat message model, its wire formatting, and the classification
//! of lines received after the handshake.

use std::fmt;

use crate::connection::ReadOutcome;
use crate::error::ConnectionError;

/// Sender name used for messages generated by the server itself
pub const SERVER_SENDER: &str = "server";

/// Kind of chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Line typed by a user
    Chat,
    /// Presence event: user admitted
    Joined,
    /// Presence event: user lost
    Left,
    /// Operator notice typed on the server
    Notice,
}

/// A transient chat message
///
/// Never stored; it only exists long enough to be broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub sender: String,
    pub body: String,
    pub kind: MessageKind,
}

impl ChatMessage {
    /// A chat line from `sender`
    pub fn chat(sender: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            body: body.into(),
            kind: MessageKind::Chat,
        }
    }

    /// Join announcement for `username`
    pub fn joined(username: impl Into<String>) -> Self {
        Self {
            sender: username.into(),
            body: String::new(),
            kind: MessageKind::Joined,
        }
    }

    /// Leave announcement for `username`
    pub fn left(username: impl Into<String>) -> Self {
        Self {
            sender: username.into(),
            body: String::new(),
            kind: MessageKind::Left,
        }
    }

    /// Operator notice; goes out verbatim
    pub fn notice(body: impl Into<String>) -> Self {
        Self {
            sender: SERVER_SENDER.to_string(),
            body: body.into(),
            kind: MessageKind::Notice,
        }
    }

    /// Whether this is a join/leave announcement
    pub fn is_presence(&self) -> bool {
        matches!(self.kind, MessageKind::Joined | MessageKind::Left)
    }

    /// Wire form, without the line separator
    pub fn to_line(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ChatMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            MessageKind::Chat => write!(f, "{}: {}", self.sender, self.body),
            MessageKind::Joined => write!(f, "{} has joined the chat.", self.sender),
            MessageKind::Left => write!(f, "{} has left the chat.", self.sender),
            MessageKind::Notice => f.write_str(&self.body),
        }
    }
}

/// A line read after the handshake, classified
#[derive(Debug)]
pub enum Incoming {
    /// Any non-empty line
    Chat(String),
    /// The peer sent an empty line: graceful end of session
    EndOfSession,
    /// The stream is gone; `None` when it simply closed
    Disconnected(Option<ConnectionError>),
}

impl From<ReadOutcome> for Incoming {
    fn from(outcome: ReadOutcome) -> Self {
        match outcome {
            ReadOutcome::Line(line) if line.is_empty() => Incoming::EndOfSession,
            ReadOutcome::Line(line) => Incoming::Chat(line),
            ReadOutcome::Closed => Incoming::Disconnected(None),
            ReadOutcome::Fault(e) => Incoming::Disconnected(Some(e)),
        }
    }
}
