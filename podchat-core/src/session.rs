//! Protocol state machine: the node passes connection events in, the session
//! updates its registry and returns actions for the node to apply.
//!
//! One session lives for one role on one election round. After a restart the
//! node builds a fresh session; the old one is retired and answers every event
//! with no actions, so late events from torn-down connections are inert.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, info};
use uuid::Uuid;

use crate::identity::{PeerId, BROADCAST_ID, HOST_ID};
use crate::names::resolve_display_name;
use crate::peer::{Peer, PeerStatus};
use crate::protocol::{ChatMessage, Envelope};
use crate::registry::PeerRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Host,
    Client,
}

/// Coordinator-level notifications for the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    PeerConnected(Peer),
    PeerDisconnected(Peer),
    MessageReceived { from: Peer, message: ChatMessage },
}

/// Side effects requested by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send to one connection. On a client the only connection is [`HOST_ID`].
    SendTo(PeerId, Envelope),
    /// Host only: send one envelope to each listed connection.
    Broadcast { envelope: Envelope, to: Vec<PeerId> },
    Notify(SessionEvent),
    /// Resolve the pending acknowledgment for a message id.
    Acknowledge(Uuid),
    /// Host only: the connection answered the last ping.
    MarkAlive(PeerId),
    /// Client only: the host is gone; re-enter election.
    Restart,
}

pub struct Session {
    role: Role,
    own_id: Mutex<Option<PeerId>>,
    requested_name: Option<String>,
    registry: PeerRegistry,
    /// Serializes name assignment so two simultaneous handshakes cannot pick the same name.
    handshake: Mutex<()>,
    active: AtomicBool,
}

impl Session {
    /// Host session. Registers our own record under [`HOST_ID`], already connected.
    pub fn host(name: Option<&str>, address: impl Into<String>) -> Self {
        let registry = PeerRegistry::new();
        let name = resolve_display_name(name, Vec::<&str>::new());
        registry.upsert(Peer::new(HOST_ID, address, name).with_status(PeerStatus::Connected));
        Self {
            role: Role::Host,
            own_id: Mutex::new(Some(HOST_ID)),
            requested_name: None,
            registry,
            handshake: Mutex::new(()),
            active: AtomicBool::new(true),
        }
    }

    /// Client session. Our identity is unknown until the host's handshake reply.
    pub fn client(name: Option<&str>) -> Self {
        Self {
            role: Role::Client,
            own_id: Mutex::new(None),
            requested_name: name.map(str::to_string),
            registry: PeerRegistry::new(),
            handshake: Mutex::new(()),
            active: AtomicBool::new(true),
        }
    }

    pub fn is_host(&self) -> bool {
        self.role == Role::Host
    }

    pub fn own_id(&self) -> Option<PeerId> {
        *self.own_id.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop reacting to events. Idempotent.
    pub fn retire(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Actions to run once the role is established.
    pub fn start(&self) -> Vec<Action> {
        if !self.is_active() || !self.is_host() {
            return vec![];
        }
        match self.registry.get(&HOST_ID) {
            Some(me) => vec![Action::Notify(SessionEvent::PeerConnected(me))],
            None => vec![],
        }
    }

    /// A connection reached the open state. Host: a client was accepted at `address`.
    /// Client: our connection to the host is up, so send the handshake.
    pub fn on_connected(&self, id: PeerId, address: &str) -> Vec<Action> {
        if !self.is_active() {
            return vec![];
        }
        match self.role {
            Role::Host => {
                self.registry.upsert(Peer::new(id, address, ""));
                vec![]
            }
            Role::Client => {
                let me = Peer::new(
                    BROADCAST_ID,
                    "",
                    self.requested_name.clone().unwrap_or_default(),
                );
                vec![Action::SendTo(HOST_ID, Envelope::Handshake(me))]
            }
        }
    }

    /// An envelope arrived on connection `from`.
    pub fn on_envelope(&self, from: PeerId, envelope: Envelope) -> Vec<Action> {
        if !self.is_active() {
            return vec![];
        }
        match self.role {
            Role::Host => self.host_envelope(from, envelope),
            Role::Client => self.client_envelope(from, envelope),
        }
    }

    /// Connection `id` is gone.
    pub fn on_disconnected(&self, id: PeerId) -> Vec<Action> {
        if !self.is_active() {
            return vec![];
        }
        match self.role {
            Role::Host => {
                if id == HOST_ID {
                    return vec![];
                }
                match self.registry.remove(&id) {
                    Some(peer) if peer.is_connected() => {
                        info!(peer = %id, name = %peer.name(), "peer left");
                        let gone = peer.with_status(PeerStatus::Disconnected);
                        vec![
                            Action::Broadcast {
                                envelope: Envelope::Peer(gone.clone()),
                                to: self.audience(Some(id)),
                            },
                            Action::Notify(SessionEvent::PeerDisconnected(gone)),
                        ]
                    }
                    _ => vec![],
                }
            }
            Role::Client if id == HOST_ID => {
                info!("lost connection to host");
                let host = self
                    .registry
                    .remove(&HOST_ID)
                    .unwrap_or_else(|| Peer::new(HOST_ID, "", ""))
                    .with_status(PeerStatus::Disconnected);
                vec![
                    Action::Notify(SessionEvent::PeerDisconnected(host)),
                    Action::Restart,
                ]
            }
            Role::Client => match self.registry.remove(&id) {
                Some(peer) => vec![Action::Notify(SessionEvent::PeerDisconnected(
                    peer.with_status(PeerStatus::Disconnected),
                ))],
                None => vec![],
            },
        }
    }

    /// Outgoing message from the local user. The host routes it in place; a client
    /// hands it to the host.
    pub fn submit(&self, message: ChatMessage) -> Vec<Action> {
        if !self.is_active() {
            return vec![];
        }
        match self.role {
            Role::Host => self.route(HOST_ID, message),
            Role::Client => vec![Action::SendTo(HOST_ID, Envelope::Message(message))],
        }
    }

    fn host_envelope(&self, from: PeerId, envelope: Envelope) -> Vec<Action> {
        match envelope {
            Envelope::Handshake(requested) => self.accept_handshake(from, &requested),
            Envelope::Peers(_) => {
                let peers = self.registry.connected().into_iter().map(Some).collect();
                vec![Action::SendTo(from, Envelope::Peers(peers))]
            }
            Envelope::Pong => vec![Action::MarkAlive(from)],
            Envelope::Message(message) => self.route(from, message),
            other => {
                debug!(peer = %from, kind = ?other.kind(), "host ignoring envelope");
                vec![]
            }
        }
    }

    fn accept_handshake(&self, from: PeerId, requested: &Peer) -> Vec<Action> {
        let _guard = self.handshake.lock().unwrap_or_else(PoisonError::into_inner);
        match self.registry.get(&from) {
            Some(current) if !current.is_connected() => {}
            _ => {
                debug!(peer = %from, "rejecting handshake");
                return vec![];
            }
        }
        let connected = self.registry.connected();
        let name = resolve_display_name(
            Some(requested.name()),
            connected.iter().map(|p| p.name()),
        );
        let Some(peer) = self.registry.host_update(&from, |current| {
            if current.is_connected() {
                None
            } else {
                Some(
                    current
                        .clone()
                        .with_name(name)
                        .with_status(PeerStatus::Connected),
                )
            }
        }) else {
            return vec![];
        };
        info!(peer = %from, name = %peer.name(), "peer joined");
        vec![
            Action::SendTo(from, Envelope::Handshake(peer.clone())),
            Action::Broadcast {
                envelope: Envelope::Peer(peer.clone()),
                to: self.audience(Some(from)),
            },
            Action::Notify(SessionEvent::PeerConnected(peer)),
        ]
    }

    /// Clients that completed the handshake, minus `except`. Pending and probe
    /// connections never receive relayed traffic.
    fn audience(&self, except: Option<PeerId>) -> Vec<PeerId> {
        self.registry
            .connected()
            .into_iter()
            .map(|p| p.id())
            .filter(|id| *id != HOST_ID && Some(*id) != except)
            .collect()
    }

    /// Host routing. Stamps the sender, then delivers to everyone or to one peer.
    /// A client sender gets the envelope echoed back as its delivery acknowledgment;
    /// the host's own sends are acknowledged in place.
    fn route(&self, from: PeerId, mut message: ChatMessage) -> Vec<Action> {
        let sender = match self.registry.get(&from) {
            Some(p) if p.is_connected() => p,
            _ => {
                debug!(peer = %from, "dropping message from unconnected sender");
                return vec![];
            }
        };
        message.sender = from;
        let from_host = from == HOST_ID;
        let mut actions = Vec::new();

        if message.is_broadcast() {
            actions.push(Action::Broadcast {
                envelope: Envelope::Message(message.clone()),
                to: self.audience(None),
            });
            if from_host {
                actions.push(Action::Acknowledge(message.id));
            } else {
                actions.push(Action::Notify(SessionEvent::MessageReceived {
                    from: sender,
                    message,
                }));
            }
            return actions;
        }

        let recipient = message.recipient;
        if !self
            .registry
            .get(&recipient)
            .map(|p| p.is_connected())
            .unwrap_or(false)
        {
            debug!(peer = %from, recipient = %recipient, "dropping message to unknown recipient");
            return actions;
        }
        if recipient == HOST_ID {
            actions.push(Action::Notify(SessionEvent::MessageReceived {
                from: sender,
                message: message.clone(),
            }));
        } else {
            actions.push(Action::SendTo(recipient, Envelope::Message(message.clone())));
        }
        if from_host {
            actions.push(Action::Acknowledge(message.id));
        } else {
            actions.push(Action::SendTo(from, Envelope::Message(message)));
        }
        actions
    }

    fn client_envelope(&self, from: PeerId, envelope: Envelope) -> Vec<Action> {
        if from != HOST_ID {
            debug!(peer = %from, "client ignoring envelope from non-host");
            return vec![];
        }
        match envelope {
            Envelope::Handshake(me) => {
                info!(peer = %me.id(), name = %me.name(), "joined as client");
                *self.own_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(me.id());
                vec![Action::SendTo(HOST_ID, Envelope::peers_request())]
            }
            Envelope::Ping => vec![Action::SendTo(HOST_ID, Envelope::Pong)],
            Envelope::Peer(peer) => self.apply_peer_update(peer),
            Envelope::Peers(list) if !list.is_empty() => self.apply_peer_snapshot(list),
            Envelope::Message(message) => {
                if Some(message.sender) == self.own_id() {
                    vec![Action::Acknowledge(message.id)]
                } else {
                    let from = self
                        .registry
                        .get(&message.sender)
                        .unwrap_or_else(|| Peer::new(message.sender, "", ""));
                    vec![Action::Notify(SessionEvent::MessageReceived { from, message })]
                }
            }
            other => {
                debug!(kind = ?other.kind(), "client ignoring envelope");
                vec![]
            }
        }
    }

    fn apply_peer_update(&self, peer: Peer) -> Vec<Action> {
        match peer.status() {
            PeerStatus::Connected => {
                let id = peer.id();
                let is_new = self.registry.upsert(peer.clone());
                if is_new && id != HOST_ID {
                    vec![Action::Notify(SessionEvent::PeerConnected(peer))]
                } else {
                    vec![]
                }
            }
            PeerStatus::Disconnected => match self.registry.remove(&peer.id()) {
                Some(_) => vec![Action::Notify(SessionEvent::PeerDisconnected(peer))],
                None => vec![],
            },
            PeerStatus::Uninitialized => vec![],
        }
    }

    fn apply_peer_snapshot(&self, list: Vec<Option<Peer>>) -> Vec<Action> {
        let incoming: Vec<Peer> = list.into_iter().flatten().collect();
        let previous = self.registry.replace_all(incoming.clone());
        let own = self.own_id();
        let mut actions = Vec::new();
        for peer in &incoming {
            if !previous.iter().any(|p| p.id() == peer.id()) {
                actions.push(Action::Notify(SessionEvent::PeerConnected(peer.clone())));
            }
        }
        for peer in previous {
            let id = peer.id();
            if incoming.iter().any(|p| p.id() == id) || Some(id) == own || id == HOST_ID {
                continue;
            }
            actions.push(Action::Notify(SessionEvent::PeerDisconnected(
                peer.with_status(PeerStatus::Disconnected),
            )));
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_id() -> PeerId {
        uuid::Uuid::new_v4()
    }

    fn hello(name: &str) -> Envelope {
        Envelope::Handshake(Peer::new(BROADCAST_ID, "", name))
    }

    /// Host with one client that has completed the handshake under `name`.
    fn host_with_client(name: &str) -> (Session, PeerId) {
        let host = Session::host(Some("Host"), "10.0.0.1");
        let id = new_id();
        host.on_connected(id, "10.0.0.2");
        host.on_envelope(id, hello(name));
        (host, id)
    }

    fn notified(actions: &[Action]) -> Vec<SessionEvent> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Notify(e) => Some(e.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn host_registers_itself() {
        let host = Session::host(None, "10.0.0.1");
        let me = host.registry().get(&HOST_ID).unwrap();
        assert!(me.is_connected());
        assert_eq!(me.name(), "Anonymous");
        assert_eq!(host.own_id(), Some(HOST_ID));
        assert_eq!(
            notified(&host.start()),
            vec![SessionEvent::PeerConnected(me)]
        );
    }

    #[test]
    fn handshake_assigns_name_and_announces() {
        let host = Session::host(Some("Host"), "10.0.0.1");
        let id = new_id();
        assert!(host.on_connected(id, "10.0.0.2").is_empty());
        assert!(!host.registry().get(&id).unwrap().is_connected());

        let actions = host.on_envelope(id, hello("Alice"));
        let peer = host.registry().get(&id).unwrap();
        assert!(peer.is_connected());
        assert_eq!(peer.name(), "Alice");
        assert_eq!(peer.address(), "10.0.0.2");
        assert_eq!(
            actions,
            vec![
                Action::SendTo(id, Envelope::Handshake(peer.clone())),
                Action::Broadcast {
                    envelope: Envelope::Peer(peer.clone()),
                    to: vec![],
                },
                Action::Notify(SessionEvent::PeerConnected(peer)),
            ]
        );
    }

    #[test]
    fn handshake_name_collision_gets_suffix() {
        let (host, _) = host_with_client("Alice");
        let b = new_id();
        host.on_connected(b, "10.0.0.3");
        host.on_envelope(b, hello("Alice"));
        assert_eq!(host.registry().get(&b).unwrap().name(), "Alice1");

        let c = new_id();
        host.on_connected(c, "10.0.0.4");
        host.on_envelope(c, hello(""));
        assert_eq!(host.registry().get(&c).unwrap().name(), "Anonymous");
    }

    #[test]
    fn repeated_or_unknown_handshake_rejected() {
        let (host, id) = host_with_client("Alice");
        assert!(host.on_envelope(id, hello("Mallory")).is_empty());
        assert_eq!(host.registry().get(&id).unwrap().name(), "Alice");
        assert!(host.on_envelope(new_id(), hello("Ghost")).is_empty());
    }

    #[test]
    fn peers_request_lists_connected_only() {
        let (host, id) = host_with_client("Alice");
        let pending = new_id();
        host.on_connected(pending, "10.0.0.9");
        let actions = host.on_envelope(id, Envelope::peers_request());
        match &actions[..] {
            [Action::SendTo(to, Envelope::Peers(list))] => {
                assert_eq!(*to, id);
                let ids: Vec<_> = list.iter().flatten().map(|p| p.id()).collect();
                assert_eq!(ids, vec![HOST_ID, id]);
            }
            other => panic!("unexpected actions: {:?}", other),
        }
    }

    #[test]
    fn pong_marks_alive() {
        let (host, id) = host_with_client("Alice");
        assert_eq!(
            host.on_envelope(id, Envelope::Pong),
            vec![Action::MarkAlive(id)]
        );
    }

    #[test]
    fn client_broadcast_is_stamped_and_surfaced() {
        let (host, id) = host_with_client("Alice");
        let mut msg = ChatMessage::new(BROADCAST_ID, "hi");
        msg.sender = HOST_ID; // spoof attempt
        let actions = host.on_envelope(id, Envelope::Message(msg.clone()));
        let mut stamped = msg.clone();
        stamped.sender = id;
        let alice = host.registry().get(&id).unwrap();
        assert_eq!(
            actions,
            vec![
                Action::Broadcast {
                    envelope: Envelope::Message(stamped.clone()),
                    to: vec![id],
                },
                Action::Notify(SessionEvent::MessageReceived {
                    from: alice,
                    message: stamped,
                }),
            ]
        );
    }

    #[test]
    fn relayed_traffic_skips_pending_connections() {
        let (host, a) = host_with_client("Alice");
        let pending = new_id();
        host.on_connected(pending, "10.0.0.9");
        let b = new_id();
        host.on_connected(b, "10.0.0.3");
        let actions = host.on_envelope(b, hello("Bob"));
        assert!(matches!(
            &actions[1],
            Action::Broadcast { envelope: Envelope::Peer(_), to } if *to == vec![a]
        ));

        let actions = host.submit(ChatMessage::new(BROADCAST_ID, "all"));
        match &actions[0] {
            Action::Broadcast { to, .. } => {
                assert_eq!(to.len(), 2);
                assert!(to.contains(&a) && to.contains(&b));
                assert!(!to.contains(&pending));
                assert!(!to.contains(&HOST_ID));
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn host_broadcast_acknowledged_in_place() {
        let host = Session::host(Some("Host"), "10.0.0.1");
        let msg = ChatMessage::new(BROADCAST_ID, "hello");
        let actions = host.submit(msg.clone());
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[1], Action::Acknowledge(msg.id));
    }

    #[test]
    fn directed_message_forwarded_and_echoed() {
        let (host, a) = host_with_client("Alice");
        let b = new_id();
        host.on_connected(b, "10.0.0.3");
        host.on_envelope(b, hello("Bob"));
        let msg = ChatMessage::new(b, "psst");
        let actions = host.on_envelope(a, Envelope::Message(msg.clone()));
        let mut stamped = msg;
        stamped.sender = a;
        assert_eq!(
            actions,
            vec![
                Action::SendTo(b, Envelope::Message(stamped.clone())),
                Action::SendTo(a, Envelope::Message(stamped)),
            ]
        );
    }

    #[test]
    fn directed_message_to_host_surfaced_and_echoed() {
        let (host, a) = host_with_client("Alice");
        let msg = ChatMessage::new(HOST_ID, "hey host");
        let actions = host.on_envelope(a, Envelope::Message(msg));
        assert!(matches!(
            &actions[..],
            [
                Action::Notify(SessionEvent::MessageReceived { .. }),
                Action::SendTo(to, Envelope::Message(_)),
            ] if *to == a
        ));
    }

    #[test]
    fn host_directed_send_acknowledged() {
        let (host, a) = host_with_client("Alice");
        let msg = ChatMessage::new(a, "hi alice");
        let actions = host.submit(msg.clone());
        assert_eq!(actions.len(), 2);
        assert!(matches!(&actions[0], Action::SendTo(to, _) if *to == a));
        assert_eq!(actions[1], Action::Acknowledge(msg.id));
    }

    #[test]
    fn message_from_unconnected_or_to_unknown_dropped() {
        let host = Session::host(Some("Host"), "10.0.0.1");
        let id = new_id();
        host.on_connected(id, "10.0.0.2");
        let msg = ChatMessage::new(BROADCAST_ID, "too early");
        assert!(host.on_envelope(id, Envelope::Message(msg)).is_empty());

        let (host, a) = host_with_client("Alice");
        let msg = ChatMessage::new(new_id(), "nobody");
        assert!(host.on_envelope(a, Envelope::Message(msg)).is_empty());
    }

    #[test]
    fn host_announces_departure_of_connected_peer_only() {
        let (host, a) = host_with_client("Alice");
        let pending = new_id();
        host.on_connected(pending, "10.0.0.9");
        assert!(host.on_disconnected(pending).is_empty());
        assert!(!host.registry().contains(&pending));

        let b = new_id();
        host.on_connected(b, "10.0.0.3");
        host.on_envelope(b, hello("Bob"));
        let actions = host.on_disconnected(a);
        assert!(matches!(
            &actions[0],
            Action::Broadcast { envelope: Envelope::Peer(p), to }
                if p.id() == a && p.status() == PeerStatus::Disconnected && *to == vec![b]
        ));
        assert!(!host.registry().contains(&a));
        assert!(host.on_disconnected(a).is_empty());
    }

    #[test]
    fn client_handshake_then_requests_peers() {
        let client = Session::client(Some("Alice"));
        let actions = client.on_connected(HOST_ID, "10.0.0.1");
        assert!(matches!(
            &actions[..],
            [Action::SendTo(to, Envelope::Handshake(p))] if *to == HOST_ID && p.name() == "Alice"
        ));
        let me = new_id();
        let reply = Peer::new(me, "10.0.0.2", "Alice").with_status(PeerStatus::Connected);
        let actions = client.on_envelope(HOST_ID, Envelope::Handshake(reply));
        assert_eq!(client.own_id(), Some(me));
        assert_eq!(
            actions,
            vec![Action::SendTo(HOST_ID, Envelope::peers_request())]
        );
    }

    #[test]
    fn client_answers_ping() {
        let client = Session::client(None);
        assert_eq!(
            client.on_envelope(HOST_ID, Envelope::Ping),
            vec![Action::SendTo(HOST_ID, Envelope::Pong)]
        );
    }

    #[test]
    fn client_snapshot_diff() {
        let client = Session::client(Some("Alice"));
        let me = Peer::new(new_id(), "10.0.0.2", "Alice").with_status(PeerStatus::Connected);
        client.on_envelope(HOST_ID, Envelope::Handshake(me.clone()));
        let host = Peer::new(HOST_ID, "10.0.0.1", "Host").with_status(PeerStatus::Connected);
        let bob = Peer::new(new_id(), "10.0.0.3", "Bob").with_status(PeerStatus::Connected);

        let actions = client.on_envelope(
            HOST_ID,
            Envelope::Peers(vec![Some(host.clone()), None, Some(me.clone()), Some(bob.clone())]),
        );
        assert_eq!(
            notified(&actions),
            vec![
                SessionEvent::PeerConnected(host.clone()),
                SessionEvent::PeerConnected(me.clone()),
                SessionEvent::PeerConnected(bob.clone()),
            ]
        );

        let actions = client.on_envelope(
            HOST_ID,
            Envelope::Peers(vec![Some(host), Some(me)]),
        );
        assert_eq!(
            notified(&actions),
            vec![SessionEvent::PeerDisconnected(
                bob.with_status(PeerStatus::Disconnected)
            )]
        );
        assert_eq!(client.registry().len(), 2);
    }

    #[test]
    fn client_peer_updates() {
        let client = Session::client(None);
        let bob = Peer::new(new_id(), "10.0.0.3", "Bob").with_status(PeerStatus::Connected);
        let actions = client.on_envelope(HOST_ID, Envelope::Peer(bob.clone()));
        assert_eq!(
            notified(&actions),
            vec![SessionEvent::PeerConnected(bob.clone())]
        );
        // Already known: no second event.
        assert!(client
            .on_envelope(HOST_ID, Envelope::Peer(bob.clone()))
            .is_empty());

        let gone = bob.with_status(PeerStatus::Disconnected);
        let actions = client.on_envelope(HOST_ID, Envelope::Peer(gone.clone()));
        assert_eq!(
            notified(&actions),
            vec![SessionEvent::PeerDisconnected(gone.clone())]
        );
        assert!(client.on_envelope(HOST_ID, Envelope::Peer(gone)).is_empty());
    }

    #[test]
    fn client_message_ack_vs_delivery() {
        let client = Session::client(None);
        let me = Peer::new(new_id(), "", "Alice").with_status(PeerStatus::Connected);
        client.on_envelope(HOST_ID, Envelope::Handshake(me.clone()));

        let mut echo = ChatMessage::new(BROADCAST_ID, "mine");
        echo.sender = me.id();
        assert_eq!(
            client.on_envelope(HOST_ID, Envelope::Message(echo.clone())),
            vec![Action::Acknowledge(echo.id)]
        );

        let mut other = ChatMessage::new(BROADCAST_ID, "theirs");
        other.sender = new_id();
        let actions = client.on_envelope(HOST_ID, Envelope::Message(other.clone()));
        assert!(matches!(
            &actions[..],
            [Action::Notify(SessionEvent::MessageReceived { message, .. })] if *message == other
        ));
    }

    #[test]
    fn client_ignores_non_host_and_requests() {
        let client = Session::client(None);
        let msg = ChatMessage::new(BROADCAST_ID, "relay");
        assert!(client
            .on_envelope(new_id(), Envelope::Message(msg))
            .is_empty());
        assert!(client
            .on_envelope(HOST_ID, Envelope::peers_request())
            .is_empty());
        assert!(client.on_envelope(HOST_ID, Envelope::Unknown).is_empty());
        assert!(client.on_envelope(HOST_ID, Envelope::Pong).is_empty());
    }

    #[test]
    fn client_losing_host_restarts() {
        let client = Session::client(None);
        let host = Peer::new(HOST_ID, "10.0.0.1", "Host").with_status(PeerStatus::Connected);
        client.on_envelope(HOST_ID, Envelope::Peers(vec![Some(host.clone())]));
        let actions = client.on_disconnected(HOST_ID);
        assert_eq!(
            actions,
            vec![
                Action::Notify(SessionEvent::PeerDisconnected(
                    host.with_status(PeerStatus::Disconnected)
                )),
                Action::Restart,
            ]
        );
    }

    #[test]
    fn retired_session_is_inert() {
        let (host, a) = host_with_client("Alice");
        host.retire();
        assert!(host.on_disconnected(a).is_empty());
        assert!(host.submit(ChatMessage::new(BROADCAST_ID, "x")).is_empty());
        assert!(host.start().is_empty());
        assert!(host.registry().contains(&a));
    }
}
