//! Session coordinator: picks a role, runs the protocol session for it, and
//! re-elects a host when the current one goes away.
//!
//! The coordinator owns at most one [`RoleRuntime`] at a time (a session plus
//! the transport it drives). Connection events are fed to that session and the
//! returned [`Action`]s are applied here. A restart retires the session first, so
//! events still in flight from the old transport are dropped.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use dashmap::DashMap;
use podchat_core::wire::EnvelopeCodec;
use podchat_core::{
    election_delay, Action, BincodeCodec, ChatMessage, Envelope, Peer, PeerId, Session,
    SessionEvent, HOST_ID,
};
use tokio::sync::{broadcast, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::connection::ConnectionHandler;
use crate::connector::{find_host, Connector};
use crate::error::{NodeError, NodeResult};
use crate::heartbeat::HeartbeatMonitor;
use crate::listener::Listener;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Electing (also the state before `begin`).
    Starting,
    Hosting,
    ConnectedAsClient,
    /// Election retries exhausted. Only `dispose` or a new `begin` leave this state.
    Failed,
    Disposed,
}

/// Startup parameters and timeouts. Usually built from [`Config::options`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorOptions {
    pub port: u16,
    /// Fallback address probed when no previous peer is hosting.
    pub host: Option<String>,
    pub name: Option<String>,
    pub probe_timeout: Duration,
    /// Wait for a delivery acknowledgment. Also the ceiling of the election jitter.
    pub ack_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub max_start_attempts: u32,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Config::default().options()
    }
}

/// A chat message surfaced to the local user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub from: Peer,
    pub message: ChatMessage,
}

#[derive(Clone)]
enum Transport {
    Host {
        listener: Arc<Listener>,
        heartbeat: Option<Arc<HeartbeatMonitor>>,
    },
    Client {
        connector: Arc<Connector>,
    },
}

struct RoleRuntime {
    session: Arc<Session>,
    transport: Transport,
}

struct Inner {
    options: CoordinatorOptions,
    codec: Arc<dyn EnvelopeCodec>,
    runtime: Mutex<Option<RoleRuntime>>,
    /// Held while a session step runs and its actions are queued.
    dispatch: Mutex<()>,
    /// Message id → waiter in `send_sync`.
    pending: DashMap<Uuid, oneshot::Sender<()>>,
    restart_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    disposed: AtomicBool,
    state: watch::Sender<CoordinatorState>,
    peer_connected: broadcast::Sender<Peer>,
    peer_disconnected: broadcast::Sender<Peer>,
    message_received: broadcast::Sender<IncomingMessage>,
}

/// One chat participant. Several may live in one process.
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(options: CoordinatorOptions) -> Self {
        Self::with_codec(options, Arc::new(BincodeCodec))
    }

    pub fn with_codec(options: CoordinatorOptions, codec: Arc<dyn EnvelopeCodec>) -> Self {
        let (state, _) = watch::channel(CoordinatorState::Starting);
        let (peer_connected, _) = broadcast::channel(EVENT_CAPACITY);
        let (peer_disconnected, _) = broadcast::channel(EVENT_CAPACITY);
        let (message_received, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                options,
                codec,
                runtime: Mutex::new(None),
                dispatch: Mutex::new(()),
                pending: DashMap::new(),
                restart_lock: tokio::sync::Mutex::new(()),
                cancel: CancellationToken::new(),
                disposed: AtomicBool::new(false),
                state,
                peer_connected,
                peer_disconnected,
                message_received,
            }),
        }
    }

    /// Run the election and take a role. Returns once hosting or connected, or
    /// with [`NodeError::ElectionExhausted`] after the retry budget is spent.
    /// Calling it again tears down the current role and elects afresh.
    pub async fn begin(&self) -> NodeResult<()> {
        self.inner.clone().restart(None).await
    }

    /// Tear everything down. Unblocks pending `send_sync` calls. Idempotent.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();
        let _guard = self.inner.restart_lock.lock().await;
        self.inner.teardown();
        self.inner.set_state(CoordinatorState::Disposed);
        info!("coordinator disposed");
    }

    pub fn is_host(&self) -> bool {
        self.inner
            .current_session()
            .map(|s| s.is_host())
            .unwrap_or(false)
    }

    /// Our id in the current session. [`HOST_ID`] while hosting; `None` until a
    /// client's handshake completes.
    pub fn own_identity(&self) -> Option<PeerId> {
        self.inner.current_session().and_then(|s| s.own_id())
    }

    /// Copy of the registry in insertion order.
    pub fn peers(&self) -> Vec<Peer> {
        self.inner
            .current_session()
            .map(|s| s.registry().snapshot())
            .unwrap_or_default()
    }

    pub fn state(&self) -> CoordinatorState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CoordinatorState> {
        self.inner.state.subscribe()
    }

    pub fn on_peer_connected(&self) -> broadcast::Receiver<Peer> {
        self.inner.peer_connected.subscribe()
    }

    pub fn on_peer_disconnected(&self) -> broadcast::Receiver<Peer> {
        self.inner.peer_disconnected.subscribe()
    }

    pub fn on_message_received(&self) -> broadcast::Receiver<IncomingMessage> {
        self.inner.message_received.subscribe()
    }

    /// Fire-and-forget send. `recipient` is a peer id or [`podchat_core::BROADCAST_ID`].
    pub fn send(&self, recipient: PeerId, text: impl Into<String>) -> Uuid {
        let message = ChatMessage::new(recipient, text);
        let id = message.id;
        self.inner.submit(message);
        id
    }

    /// Send and wait for the host's delivery acknowledgment. False on timeout,
    /// on disposal, or when no role is active.
    pub async fn send_sync(&self, recipient: PeerId, text: impl Into<String>) -> bool {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::Acquire) {
            return false;
        }
        let message = ChatMessage::new(recipient, text);
        let id = message.id;
        let (tx, rx) = oneshot::channel();
        inner.pending.insert(id, tx);
        inner.submit(message);
        let acked = tokio::select! {
            _ = inner.cancel.cancelled() => false,
            r = tokio::time::timeout(inner.options.ack_timeout, rx) => matches!(r, Ok(Ok(()))),
        };
        inner.pending.remove(&id);
        if !acked {
            debug!(message = %id, "no acknowledgment");
        }
        acked
    }

    /// Waiters currently registered by `send_sync`.
    pub fn pending_acknowledgments(&self) -> usize {
        self.inner.pending.len()
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.inner.disposed.store(true, Ordering::Release);
        self.inner.cancel.cancel();
        self.inner.teardown();
    }
}

/// Routes one connection's events into the session it was created for.
struct SessionHandler {
    session: Arc<Session>,
    coordinator: Weak<Inner>,
}

impl SessionHandler {
    fn dispatch(&self, step: impl FnOnce(&Session) -> Vec<Action>) {
        if let Some(inner) = self.coordinator.upgrade() {
            inner.drive(&self.session, step);
        }
    }
}

impl ConnectionHandler for SessionHandler {
    fn on_connect(&self, id: PeerId, remote: SocketAddr) {
        info!(peer = %id, addr = %remote, "connection open");
        let address = remote.ip().to_string();
        self.dispatch(|s| s.on_connected(id, &address));
    }

    fn on_message(&self, id: PeerId, envelope: Envelope) {
        self.dispatch(|s| s.on_envelope(id, envelope));
    }

    fn on_close(&self, id: PeerId) {
        debug!(peer = %id, "connection closed");
        self.dispatch(|s| s.on_disconnected(id));
    }

    fn on_error(&self, id: PeerId, error: &NodeError) {
        debug!(peer = %id, error = %error, "connection error");
    }
}

impl Inner {
    fn lock_runtime(&self) -> std::sync::MutexGuard<'_, Option<RoleRuntime>> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_session(&self) -> Option<Arc<Session>> {
        self.lock_runtime().as_ref().map(|rt| rt.session.clone())
    }

    /// Transport of the runtime `session` belongs to, if it is still the live one.
    fn transport_for(&self, session: &Arc<Session>) -> Option<Transport> {
        if !session.is_active() {
            return None;
        }
        match &*self.lock_runtime() {
            Some(rt) if Arc::ptr_eq(&rt.session, session) => Some(rt.transport.clone()),
            _ => None,
        }
    }

    fn set_state(&self, next: CoordinatorState) {
        self.state.send_if_modified(|current| {
            if *current == CoordinatorState::Disposed || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn submit(self: &Arc<Self>, message: ChatMessage) {
        let Some(session) = self.current_session() else {
            debug!(message = %message.id, "no active role, message dropped");
            return;
        };
        self.drive(&session, |s| s.submit(message));
    }

    /// Run one session step and queue its actions before the next step starts.
    /// Every outbound queue then sees registry changes in the order they were made:
    /// a PEERS snapshot cannot land behind a PEER update it does not include.
    fn drive(self: &Arc<Self>, session: &Arc<Session>, step: impl FnOnce(&Session) -> Vec<Action>) {
        let _order = self.dispatch.lock().unwrap_or_else(PoisonError::into_inner);
        let actions = step(session.as_ref());
        if !actions.is_empty() {
            self.apply(session, actions);
        }
    }

    fn apply(self: &Arc<Self>, session: &Arc<Session>, actions: Vec<Action>) {
        let Some(transport) = self.transport_for(session) else {
            return;
        };
        for action in actions {
            match action {
                Action::SendTo(to, envelope) => match &transport {
                    Transport::Host { listener, .. } => {
                        if let Err(e) = listener.send_to(to, &envelope) {
                            debug!(peer = %to, error = %e, "send dropped");
                        }
                    }
                    Transport::Client { connector } => connector.send(&envelope),
                },
                Action::Broadcast { envelope, to } => {
                    if let Transport::Host { listener, .. } = &transport {
                        for id in to {
                            if let Err(e) = listener.send_to(id, &envelope) {
                                debug!(peer = %id, error = %e, "broadcast target gone");
                            }
                        }
                    }
                }
                Action::Notify(event) => self.notify(event),
                Action::Acknowledge(id) => {
                    if let Some((_, waiter)) = self.pending.remove(&id) {
                        let _ = waiter.send(());
                    }
                }
                Action::MarkAlive(id) => {
                    if let Transport::Host {
                        heartbeat: Some(heartbeat),
                        ..
                    } = &transport
                    {
                        heartbeat.mark_alive(id);
                    }
                }
                Action::Restart => {
                    let inner = self.clone();
                    let session = session.clone();
                    tokio::spawn(async move {
                        if let Err(e) = inner.restart(Some(session)).await {
                            match e {
                                NodeError::Disposed => debug!("restart abandoned: disposed"),
                                e => error!(error = %e, "restart failed"),
                            }
                        }
                    });
                }
            }
        }
    }

    fn notify(&self, event: SessionEvent) {
        // Send errors only mean nobody is subscribed.
        match event {
            SessionEvent::PeerConnected(peer) => {
                let _ = self.peer_connected.send(peer);
            }
            SessionEvent::PeerDisconnected(peer) => {
                let _ = self.peer_disconnected.send(peer);
            }
            SessionEvent::MessageReceived { from, message } => {
                let _ = self
                    .message_received
                    .send(IncomingMessage { from, message });
            }
        }
    }

    /// Drop the current role. Returns the registry snapshot and own id it had.
    fn teardown(&self) -> (Vec<Peer>, Option<PeerId>) {
        let runtime = self.lock_runtime().take();
        // Dropping the senders wakes every send_sync waiter with a failure.
        self.pending.clear();
        let Some(rt) = runtime else {
            return (Vec::new(), None);
        };
        rt.session.retire();
        let peers = rt.session.registry().snapshot();
        let own = rt.session.own_id();
        rt.session.registry().clear();
        match rt.transport {
            Transport::Host {
                listener,
                heartbeat,
            } => {
                if let Some(h) = heartbeat {
                    h.stop();
                }
                listener.stop();
            }
            Transport::Client { connector } => connector.stop(),
        }
        debug!(peers = peers.len(), "role torn down");
        (peers, own)
    }

    fn install(&self, runtime: RoleRuntime) {
        *self.lock_runtime() = Some(runtime);
    }

    fn uninstall(&self, session: &Arc<Session>) {
        session.retire();
        let mut runtime = self.lock_runtime();
        if matches!(&*runtime, Some(rt) if Arc::ptr_eq(&rt.session, session)) {
            *runtime = None;
        }
    }

    /// Tear down and elect. `requested_by` is the session that lost its host;
    /// if it is no longer current, someone else already restarted and this is a no-op.
    async fn restart(self: Arc<Self>, requested_by: Option<Arc<Session>>) -> NodeResult<()> {
        let _guard = tokio::select! {
            _ = self.cancel.cancelled() => return Err(NodeError::Disposed),
            g = self.restart_lock.lock() => g,
        };
        if self.disposed.load(Ordering::Acquire) {
            return Err(NodeError::Disposed);
        }
        if let Some(requester) = &requested_by {
            let current = self.current_session();
            if !matches!(&current, Some(s) if Arc::ptr_eq(s, requester)) {
                debug!("stale restart request ignored");
                return Ok(());
            }
        }

        self.set_state(CoordinatorState::Starting);
        let (peers, own) = self.teardown();
        let max = self.options.max_start_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.elect(&peers, own).await {
                Ok(()) => return Ok(()),
                Err(NodeError::Disposed) => {
                    self.teardown();
                    return Err(NodeError::Disposed);
                }
                Err(e) if attempt >= max => {
                    error!(attempts = attempt, error = %e, "election failed, giving up");
                    self.set_state(CoordinatorState::Failed);
                    return Err(NodeError::ElectionExhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    warn!(attempt, error = %e, "election attempt failed, retrying");
                }
            }
        }
    }

    async fn elect(self: &Arc<Self>, peers: &[Peer], own: Option<PeerId>) -> NodeResult<()> {
        if let (false, Some(own)) = (peers.is_empty(), own) {
            let delay = election_delay(&own, self.options.ack_timeout);
            debug!(delay_ms = delay.as_millis() as u64, "election backoff");
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(NodeError::Disposed),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        match self.locate_host(peers, own).await? {
            Some(address) => self.become_client(&address).await,
            None => self.become_host().await,
        }
    }

    /// Probe previous peers in registry order, then the fallback address.
    async fn locate_host(&self, peers: &[Peer], own: Option<PeerId>) -> NodeResult<Option<String>> {
        let mut probed = HashSet::new();
        let candidates = peers
            .iter()
            .filter(|p| p.id() != HOST_ID && Some(p.id()) != own)
            .map(|p| p.address())
            .chain(self.options.host.as_deref());
        for address in candidates {
            if address.is_empty() || !probed.insert(address.to_string()) {
                continue;
            }
            if self.cancel.is_cancelled() {
                return Err(NodeError::Disposed);
            }
            let found = find_host(
                address,
                self.options.port,
                self.options.probe_timeout,
                self.codec.clone(),
                &self.cancel,
            )
            .await;
            if found {
                info!(host = %address, port = self.options.port, "found host");
                return Ok(Some(address.to_string()));
            }
        }
        if self.cancel.is_cancelled() {
            return Err(NodeError::Disposed);
        }
        Ok(None)
    }

    fn handler(self: &Arc<Self>, session: &Arc<Session>) -> Arc<SessionHandler> {
        Arc::new(SessionHandler {
            session: session.clone(),
            coordinator: Arc::downgrade(self),
        })
    }

    async fn become_host(self: &Arc<Self>) -> NodeResult<()> {
        let address = local_address().await;
        let session = Arc::new(Session::host(self.options.name.as_deref(), address));
        let listener = Arc::new(Listener::new(
            self.codec.clone(),
            self.handler(&session),
            &self.cancel,
        ));
        // Installed before binding so the first accepted connection already has a session.
        self.install(RoleRuntime {
            session: session.clone(),
            transport: Transport::Host {
                listener: listener.clone(),
                heartbeat: None,
            },
        });
        if let Err(e) = listener.start(self.options.port).await {
            self.uninstall(&session);
            listener.stop();
            return Err(e);
        }

        let heartbeat = Arc::new(HeartbeatMonitor::start(
            listener.clone(),
            self.options.heartbeat_interval,
            &self.cancel,
        ));
        {
            let mut runtime = self.lock_runtime();
            match &mut *runtime {
                Some(RoleRuntime {
                    session: current,
                    transport: Transport::Host { heartbeat: slot, .. },
                }) if Arc::ptr_eq(current, &session) => *slot = Some(heartbeat),
                _ => {
                    heartbeat.stop();
                    return Err(NodeError::Disposed);
                }
            }
        }
        if self.cancel.is_cancelled() {
            return Err(NodeError::Disposed);
        }

        info!(port = self.options.port, "hosting");
        self.set_state(CoordinatorState::Hosting);
        self.drive(&session, Session::start);
        Ok(())
    }

    async fn become_client(self: &Arc<Self>, address: &str) -> NodeResult<()> {
        let session = Arc::new(Session::client(self.options.name.as_deref()));
        let connector = Arc::new(Connector::new(
            self.codec.clone(),
            self.handler(&session),
            &self.cancel,
        ));
        self.install(RoleRuntime {
            session: session.clone(),
            transport: Transport::Client {
                connector: connector.clone(),
            },
        });
        if !connector.start(address, self.options.port).await {
            self.uninstall(&session);
            connector.stop();
            if self.cancel.is_cancelled() {
                return Err(NodeError::Disposed);
            }
            return Err(NodeError::ConnectFailed {
                addr: format!("{}:{}", address, self.options.port),
            });
        }
        info!(host = %address, port = self.options.port, "connected as client");
        self.set_state(CoordinatorState::ConnectedAsClient);
        Ok(())
    }
}

/// Best-effort LAN address for our own host record. Connecting a UDP socket only
/// selects a route; nothing is sent.
async fn local_address() -> String {
    let route = async {
        let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect("192.0.2.1:9").await?;
        socket.local_addr()
    };
    match route.await {
        Ok(addr) if !addr.ip().is_unspecified() => addr.ip().to_string(),
        _ => "127.0.0.1".to_string(),
    }
}
