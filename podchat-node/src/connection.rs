//! One TCP stream: framed envelopes in both directions, events out.
//!
//! Reads happen on a dedicated task and every envelope is handed to the
//! [`ConnectionHandler`] on that task, in order. Writes are queued to a writer
//! task so `send` never blocks.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use podchat_core::wire::{self, EnvelopeCodec, LEN_SIZE};
use podchat_core::{Envelope, PeerId};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{NodeError, NodeResult};

/// Receiver of connection events. Called on the connection's own read task
/// (or on the caller of `open`/`close`), so implementations must not block.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn on_connect(&self, _id: PeerId, _remote: SocketAddr) {}
    fn on_message(&self, id: PeerId, envelope: Envelope);
    fn on_close(&self, _id: PeerId) {}
    fn on_error(&self, _id: PeerId, _error: &NodeError) {}
}

enum State {
    Idle,
    Open(mpsc::UnboundedSender<Vec<u8>>),
    Closed,
}

struct Inner {
    id: PeerId,
    codec: Arc<dyn EnvelopeCodec>,
    handler: Arc<dyn ConnectionHandler>,
    state: Mutex<State>,
    cancel: CancellationToken,
}

/// Cheap handle; clones refer to the same stream.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// New idle connection. `cancel` is the owner's token; closing the owner closes this too.
    pub fn new(
        id: PeerId,
        codec: Arc<dyn EnvelopeCodec>,
        handler: Arc<dyn ConnectionHandler>,
        cancel: &CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                codec,
                handler,
                state: Mutex::new(State::Idle),
                cancel: cancel.child_token(),
            }),
        }
    }

    pub fn id(&self) -> PeerId {
        self.inner.id
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.lock_state(), State::Open(_))
    }

    /// Connect to `host:port`. Returns once the outcome is known: true if the stream
    /// is up (the connect event has fired and the read loop is running).
    pub async fn open(&self, host: &str, port: u16) -> bool {
        if !matches!(*self.lock_state(), State::Idle) {
            return false;
        }
        let connect = tokio::select! {
            _ = self.inner.cancel.cancelled() => return false,
            r = TcpStream::connect((host, port)) => r,
        };
        let stream = match connect {
            Ok(s) => s,
            Err(e) => {
                debug!(host = %host, port, error = %e, "connect failed");
                return false;
            }
        };
        let remote = match stream.peer_addr() {
            Ok(a) => a,
            Err(e) => {
                debug!(host = %host, port, error = %e, "connected stream has no peer address");
                return false;
            }
        };
        let Some(reader) = self.establish(stream) else {
            return false;
        };
        self.inner.handler.on_connect(self.inner.id, remote);
        self.spawn_read_loop(reader);
        true
    }

    /// Take ownership of a connected stream: start the writer and mark the
    /// connection open. Returns the read half, or `None` if already closed.
    /// The caller raises the connect event and then starts the read loop, so no
    /// close can be observed before the connect.
    pub(crate) fn establish(&self, stream: TcpStream) -> Option<OwnedReadHalf> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %self.inner.id, error = %e, "failed to set TCP_NODELAY");
        }
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.lock_state();
            if !matches!(*state, State::Idle) {
                return None;
            }
            *state = State::Open(tx);
        }
        tokio::spawn(write_loop(self.inner.clone(), writer, rx));
        Some(reader)
    }

    pub(crate) fn spawn_read_loop(&self, reader: OwnedReadHalf) {
        tokio::spawn(read_loop(self.clone(), reader));
    }

    /// Queue an envelope. No-op unless open.
    pub fn send(&self, envelope: &Envelope) {
        let tx = match &*self.lock_state() {
            State::Open(tx) => tx.clone(),
            _ => return,
        };
        match wire::encode_frame(self.inner.codec.as_ref(), envelope) {
            Ok(frame) => {
                // A closed channel means the writer already saw the peer hang up.
                let _ = tx.send(frame);
            }
            Err(e) => {
                let e = NodeError::from(e);
                warn!(peer = %self.inner.id, error = %e, "failed to encode envelope");
                self.inner.handler.on_error(self.inner.id, &e);
            }
        }
    }

    /// Release the stream. Idempotent; the close event fires only if the
    /// connection had been open.
    pub fn close(&self) {
        let previous = std::mem::replace(&mut *self.lock_state(), State::Closed);
        self.inner.cancel.cancel();
        if matches!(previous, State::Open(_)) {
            debug!(peer = %self.inner.id, "connection closed");
            self.inner.handler.on_close(self.inner.id);
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn read_envelope(
    reader: &mut OwnedReadHalf,
    codec: &dyn EnvelopeCodec,
) -> NodeResult<Result<Envelope, NodeError>> {
    let mut header = [0u8; LEN_SIZE];
    reader.read_exact(&mut header).await?;
    let len = wire::payload_len(header)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    // A bad payload inside a well-formed frame does not desync the stream.
    Ok(codec.decode(&payload).map_err(NodeError::from))
}

async fn read_loop(conn: Connection, mut reader: OwnedReadHalf) {
    let inner = conn.inner.clone();
    loop {
        let read = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            r = read_envelope(&mut reader, inner.codec.as_ref()) => r,
        };
        match read {
            Ok(Ok(envelope)) => inner.handler.on_message(inner.id, envelope),
            Ok(Err(e)) => {
                warn!(peer = %inner.id, error = %e, "dropping undecodable envelope");
                inner.handler.on_error(inner.id, &e);
            }
            Err(e) if e.is_disconnect() => {
                debug!(peer = %inner.id, "peer hung up");
                break;
            }
            Err(e) => {
                warn!(peer = %inner.id, error = %e, "read failed");
                inner.handler.on_error(inner.id, &e);
                break;
            }
        }
    }
    conn.close();
}

async fn write_loop(
    inner: Arc<Inner>,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    // Drains queued frames even after close, then drops the write half.
    while let Some(frame) = rx.recv().await {
        let result = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            let e = NodeError::from(e);
            if !e.is_disconnect() {
                warn!(peer = %inner.id, error = %e, "write failed");
                inner.handler.on_error(inner.id, &e);
            }
            break;
        }
    }
    let _ = writer.shutdown().await;
}
