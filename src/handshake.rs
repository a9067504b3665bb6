//! Authentication handshake
//!
//! Exchanged exactly once per connection, before any chat traffic:
//! the client sends its username as the first line, the server answers
//! with `1` (accepted) or `0|<reason>` (rejected, connection closes).

use tracing::debug;

use crate::connection::{LineReader, LineWriter, ReadOutcome};
use crate::error::ClientError;

/// Reply line for an accepted handshake
pub const ACCEPTED: &str = "1";

/// Leading character of a rejection reply
pub const REJECTED: char = '0';

/// Separator between the status and the reason
pub const SEPARATOR: char = '|';

/// Reason given when the username is already registered
pub const USERNAME_TAKEN_REASON: &str = "This username is already connected.";

/// Server's answer to an identity claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeReply {
    Accepted,
    Rejected(String),
}

impl HandshakeReply {
    /// Rejection for a duplicate username
    pub fn username_taken() -> Self {
        HandshakeReply::Rejected(USERNAME_TAKEN_REASON.to_string())
    }

    /// Wire form, without the line separator
    pub fn to_line(&self) -> String {
        match self {
            HandshakeReply::Accepted => ACCEPTED.to_string(),
            HandshakeReply::Rejected(reason) => format!("{}{}{}", REJECTED, SEPARATOR, reason),
        }
    }

    /// Parse a reply line
    ///
    /// Only the first character decides: `1` accepts, anything else rejects.
    /// The reason is whatever follows the first `|`, empty if there is none.
    pub fn parse(line: &str) -> Result<Self, ClientError> {
        match line.chars().next() {
            None => Err(ClientError::Protocol("empty handshake reply".to_string())),
            Some('1') => Ok(HandshakeReply::Accepted),
            Some(_) => {
                let reason = line
                    .split_once(SEPARATOR)
                    .map(|(_, reason)| reason)
                    .unwrap_or_default();
                Ok(HandshakeReply::Rejected(reason.to_string()))
            }
        }
    }
}

/// Server side: read the identity claim from a fresh connection
///
/// Any line is a candidate username, including an empty one.
/// Returns `None` if the connection ends first.
pub async fn read_identity(reader: &mut LineReader) -> Option<String> {
    match reader.read_line().await {
        ReadOutcome::Line(username) => Some(username),
        ReadOutcome::Closed => {
            debug!("Connection closed before identity claim");
            None
        }
        ReadOutcome::Fault(e) => {
            debug!("Fault before identity claim: {}", e);
            None
        }
    }
}

/// Client side: claim `username` and wait for the server's verdict
///
/// A missing reply (connection closed or faulted) is an error; a rejection
/// is returned as `Ok(Rejected(..))` so the caller can surface the reason.
pub async fn authenticate(
    reader: &mut LineReader,
    writer: &LineWriter,
    username: &str,
) -> Result<HandshakeReply, ClientError> {
    writer.write_line(username)?;

    match reader.read_line().await {
        ReadOutcome::Line(line) => HandshakeReply::parse(&line),
        ReadOutcome::Closed => Err(ClientError::Protocol(
            "connection closed during handshake".to_string(),
        )),
        ReadOutcome::Fault(e) => Err(e.into()),
    }
}
