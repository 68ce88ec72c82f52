//! Outbound connection to the host (client role) and the "is anybody home" probe.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use podchat_core::wire::EnvelopeCodec;
use podchat_core::{Envelope, PeerId, HOST_ID};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::{Connection, ConnectionHandler};

/// The client's single connection. Always identified as [`HOST_ID`].
pub struct Connector {
    connection: Connection,
}

impl Connector {
    pub fn new(
        codec: Arc<dyn EnvelopeCodec>,
        handler: Arc<dyn ConnectionHandler>,
        cancel: &CancellationToken,
    ) -> Self {
        Self {
            connection: Connection::new(HOST_ID, codec, handler, cancel),
        }
    }

    /// Connect to the host. Returns once the outcome is known.
    pub async fn start(&self, host: &str, port: u16) -> bool {
        self.connection.open(host, port).await
    }

    pub fn send(&self, envelope: &Envelope) {
        self.connection.send(envelope);
    }

    pub fn stop(&self) {
        self.connection.close();
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.connection.close();
    }
}

struct Probe;

impl ConnectionHandler for Probe {
    fn on_connect(&self, _id: PeerId, remote: SocketAddr) {
        debug!(addr = %remote, "probe connected");
    }

    fn on_message(&self, _id: PeerId, _envelope: Envelope) {}
}

/// True iff something accepts a connection at `host:port` within `timeout`.
/// The probe connection is always closed before returning.
pub async fn find_host(
    host: &str,
    port: u16,
    timeout: Duration,
    codec: Arc<dyn EnvelopeCodec>,
    cancel: &CancellationToken,
) -> bool {
    let probe = Connection::new(HOST_ID, codec, Arc::new(Probe), cancel);
    let found = matches!(
        tokio::time::timeout(timeout, probe.open(host, port)).await,
        Ok(true)
    );
    probe.close();
    debug!(host = %host, port, found, "probed for host");
    found
}
