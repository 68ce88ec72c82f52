//! Peer record: identity, address, display name, status.

use serde::{Deserialize, Serialize};

use crate::identity::{PeerId, HOST_ID};

/// Lifecycle of a peer as seen by the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerStatus {
    /// Accepted but not yet through the handshake.
    #[default]
    Uninitialized,
    Connected,
    Disconnected,
}

/// One participant. Value type: copies received over the wire are mirrors, and
/// host-side corrections go through [`crate::PeerRegistry::host_update`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    id: PeerId,
    address: String,
    name: String,
    status: PeerStatus,
}

impl Peer {
    pub fn new(id: PeerId, address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            name: name.into(),
            status: PeerStatus::Uninitialized,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> PeerStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status == PeerStatus::Connected
    }

    /// True for the record registered under the reserved host id.
    pub fn is_host(&self) -> bool {
        self.id == HOST_ID
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_status(mut self, status: PeerStatus) -> Self {
        self.status = status;
        self
    }
}
