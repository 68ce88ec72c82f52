//! podchat wire protocol: envelope types and chat payload.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::{PeerId, BROADCAST_ID};
use crate::peer::Peer;

/// Discriminant of an [`Envelope`], for logging and dispatch tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Unknown,
    Handshake,
    Ping,
    Pong,
    Peer,
    Peers,
    Message,
}

/// A chat message. `sender` is stamped by the routing host; whatever the
/// originator puts there is overwritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub sender: PeerId,
    pub recipient: PeerId,
    pub text: String,
}

impl ChatMessage {
    /// New message with a fresh id and an unspecified sender.
    pub fn new(recipient: PeerId, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: BROADCAST_ID,
            recipient,
            text: text.into(),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient == BROADCAST_ID
    }
}

/// All wire message types. Encoding is pluggable (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    /// Placeholder for an unrecognised type; always ignored.
    Unknown,
    /// Client → host: desired name. Host → client: canonical record with assigned id.
    Handshake(Peer),
    /// Host liveness probe.
    Ping,
    /// Answer to `Ping`.
    Pong,
    /// Incremental update of one peer's status.
    Peer(Peer),
    /// Empty: request for the peer list. Non-empty: full snapshot. `None` slots are skipped.
    Peers(Vec<Option<Peer>>),
    /// Chat message, directed or broadcast.
    Message(ChatMessage),
}

impl Envelope {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::Unknown => EnvelopeKind::Unknown,
            Envelope::Handshake(_) => EnvelopeKind::Handshake,
            Envelope::Ping => EnvelopeKind::Ping,
            Envelope::Pong => EnvelopeKind::Pong,
            Envelope::Peer(_) => EnvelopeKind::Peer,
            Envelope::Peers(_) => EnvelopeKind::Peers,
            Envelope::Message(_) => EnvelopeKind::Message,
        }
    }

    /// Request for the full peer list.
    pub fn peers_request() -> Self {
        Envelope::Peers(Vec::new())
    }
}
