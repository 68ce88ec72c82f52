//! podchat protocol reference implementation.
//! Host-driven: no I/O; the node passes connection events in and applies the returned actions.

pub mod identity;
pub mod names;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod wire;

pub use identity::{election_delay, fresh_peer_id, is_reserved, PeerId, BROADCAST_ID, HOST_ID};
pub use names::{resolve_display_name, DEFAULT_NAME};
pub use peer::{Peer, PeerStatus};
pub use protocol::{ChatMessage, Envelope, EnvelopeKind};
pub use registry::PeerRegistry;
pub use session::{Action, Role, Session, SessionEvent};
pub use wire::{encode_frame, BincodeCodec, EnvelopeCodec, FrameDecodeError, FrameEncodeError};
