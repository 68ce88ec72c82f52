//! Node error types.

use std::io;

use podchat_core::{FrameDecodeError, FrameEncodeError, PeerId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    /// I/O error on a socket.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] FrameEncodeError),

    #[error("decode error: {0}")]
    Decode(#[from] FrameDecodeError),

    /// Bind failed because the port is taken; someone else is hosting.
    #[error("address already in use: port {port}")]
    AddressInUse { port: u16 },

    #[error("could not connect to host at {addr}")]
    ConnectFailed { addr: String },

    #[error("peer not found: {0}")]
    PeerNotFound(PeerId),

    /// Election failed on every attempt. Not retried.
    #[error("election failed after {attempts} attempts: {last}")]
    ElectionExhausted { attempts: u32, last: Box<NodeError> },

    #[error("coordinator disposed")]
    Disposed,
}

impl NodeError {
    /// Errors that are expected when the remote side hangs up.
    pub fn is_disconnect(&self) -> bool {
        match self {
            NodeError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

/// Result type for node operations.
pub type NodeResult<T> = Result<T, NodeError>;
