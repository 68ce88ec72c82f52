//! Inbound connection listener (host role).

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use podchat_core::wire::EnvelopeCodec;
use podchat_core::{fresh_peer_id, Envelope, PeerId};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionHandler};
use crate::error::{NodeError, NodeResult};

type ConnectionMap = Mutex<HashMap<PeerId, Connection>>;

/// Accepts connections on one port, assigns each a fresh [`PeerId`] and keeps the
/// live set. Events from every connection reach the handler tagged with that id.
pub struct Listener {
    codec: Arc<dyn EnvelopeCodec>,
    connections: Arc<ConnectionMap>,
    handler: Arc<Tracked>,
    cancel: CancellationToken,
}

/// Forwards connection events, dropping closed connections from the live set first.
struct Tracked {
    connections: Weak<ConnectionMap>,
    downstream: Arc<dyn ConnectionHandler>,
}

impl ConnectionHandler for Tracked {
    fn on_connect(&self, id: PeerId, remote: SocketAddr) {
        self.downstream.on_connect(id, remote);
    }

    fn on_message(&self, id: PeerId, envelope: Envelope) {
        self.downstream.on_message(id, envelope);
    }

    fn on_close(&self, id: PeerId) {
        if let Some(map) = self.connections.upgrade() {
            map.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
        }
        self.downstream.on_close(id);
    }

    fn on_error(&self, id: PeerId, error: &NodeError) {
        self.downstream.on_error(id, error);
    }
}

impl Listener {
    pub fn new(
        codec: Arc<dyn EnvelopeCodec>,
        handler: Arc<dyn ConnectionHandler>,
        cancel: &CancellationToken,
    ) -> Self {
        let connections: Arc<ConnectionMap> = Arc::new(Mutex::new(HashMap::new()));
        let handler = Arc::new(Tracked {
            connections: Arc::downgrade(&connections),
            downstream: handler,
        });
        Self {
            codec,
            connections,
            handler,
            cancel: cancel.child_token(),
        }
    }

    /// Bind `port` on all interfaces and start accepting.
    /// A taken port is reported as [`NodeError::AddressInUse`].
    pub async fn start(&self, port: u16) -> NodeResult<SocketAddr> {
        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(l) => l,
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                return Err(NodeError::AddressInUse { port })
            }
            Err(e) => return Err(e.into()),
        };
        let local = listener.local_addr()?;
        info!(addr = %local, "listening for peers");
        tokio::spawn(accept_loop(
            listener,
            self.codec.clone(),
            self.connections.clone(),
            self.handler.clone(),
            self.cancel.clone(),
        ));
        Ok(local)
    }

    /// Stop accepting and close every live connection. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
        let live: Vec<Connection> = self
            .lock()
            .drain()
            .map(|(_, c)| c)
            .collect();
        for conn in live {
            conn.close();
        }
    }

    pub fn send_to(&self, id: PeerId, envelope: &Envelope) -> NodeResult<()> {
        let conn = self.lock().get(&id).cloned();
        match conn {
            Some(c) => {
                c.send(envelope);
                Ok(())
            }
            None => Err(NodeError::PeerNotFound(id)),
        }
    }

    /// Send to every live connection, handshaken or not.
    pub fn broadcast(&self, envelope: &Envelope) {
        let targets: Vec<Connection> = self.lock().values().cloned().collect();
        for conn in targets {
            conn.send(envelope);
        }
    }

    /// Force-close one connection. Returns false if it was not live.
    pub fn disconnect(&self, id: PeerId) -> bool {
        let conn = self.lock().remove(&id);
        match conn {
            Some(c) => {
                c.close();
                true
            }
            None => false,
        }
    }

    /// Ids of the connections that are still open.
    pub fn connection_ids(&self) -> Vec<PeerId> {
        self.lock()
            .iter()
            .filter(|(_, c)| c.is_open())
            .map(|(id, _)| *id)
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PeerId, Connection>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(
    listener: TcpListener,
    codec: Arc<dyn EnvelopeCodec>,
    connections: Arc<ConnectionMap>,
    handler: Arc<Tracked>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            r = listener.accept() => r,
        };
        match accepted {
            Ok((stream, addr)) => admit(stream, addr, &codec, &connections, &handler, &cancel),
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
    debug!("accept loop stopped");
}

/// Give an accepted stream a fresh id, raise the connect event, then publish it
/// to the live set and start reading. `disconnect` and `stop` only reach published
/// connections and the read loop starts last, so every close follows its connect.
/// A `stop` that lands before publication is seen by the read loop through the
/// cancelled token, which closes the connection.
fn admit(
    stream: TcpStream,
    addr: SocketAddr,
    codec: &Arc<dyn EnvelopeCodec>,
    connections: &Arc<ConnectionMap>,
    handler: &Arc<Tracked>,
    cancel: &CancellationToken,
) {
    let handler: Arc<dyn ConnectionHandler> = handler.clone();
    // Admissions run one at a time on the accept loop, so the id stays free
    // until it is published below.
    let id = {
        let map = connections.lock().unwrap_or_else(PoisonError::into_inner);
        fresh_peer_id(|candidate| map.contains_key(candidate))
    };
    let conn = Connection::new(id, codec.clone(), handler.clone(), cancel);
    let Some(reader) = conn.establish(stream) else {
        return;
    };
    debug!(peer = %id, addr = %addr, "accepted connection");
    handler.on_connect(id, addr);
    connections
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(id, conn.clone());
    conn.spawn_read_loop(reader);
}
