//! Host-side liveness check: ping every connection, drop the ones that stay silent.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use podchat_core::{Envelope, PeerId};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::listener::Listener;

pub struct HeartbeatMonitor {
    /// Connection id → answered the last ping.
    ponged: Arc<DashMap<PeerId, bool>>,
    cancel: CancellationToken,
}

impl HeartbeatMonitor {
    /// Start pinging through `listener` every `interval`.
    pub fn start(listener: Arc<Listener>, interval: Duration, cancel: &CancellationToken) -> Self {
        let ponged = Arc::new(DashMap::new());
        let cancel = cancel.child_token();
        tokio::spawn(heartbeat_loop(
            listener,
            ponged.clone(),
            interval,
            cancel.clone(),
        ));
        Self { ponged, cancel }
    }

    /// Record a PONG from `id`. Ids that were not pinged are ignored.
    pub fn mark_alive(&self, id: PeerId) {
        if let Some(mut answered) = self.ponged.get_mut(&id) {
            *answered = true;
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn heartbeat_loop(
    listener: Arc<Listener>,
    ponged: Arc<DashMap<PeerId, bool>>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // After a stall, catch-up ticks would run a second round before any PONG for
    // the first could be read.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        beat(&listener, &ponged);
    }
    debug!("heartbeat stopped");
}

/// One round: drop silent connections, reset the answered set, ping everyone.
fn beat(listener: &Listener, ponged: &DashMap<PeerId, bool>) {
    let silent: Vec<PeerId> = ponged
        .iter()
        .filter(|e| !*e.value())
        .map(|e| *e.key())
        .collect();
    for id in silent {
        if listener.disconnect(id) {
            info!(peer = %id, "dropping unresponsive peer");
        }
    }
    ponged.clear();
    for id in listener.connection_ids() {
        ponged.insert(id, false);
    }
    listener.broadcast(&Envelope::Ping);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionHandler;
    use podchat_core::BincodeCodec;
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use tokio::net::TcpStream;

    #[derive(Default)]
    struct Closes(Mutex<Vec<PeerId>>);

    impl ConnectionHandler for Closes {
        fn on_message(&self, _id: PeerId, _envelope: Envelope) {}
        fn on_close(&self, id: PeerId) {
            self.0.lock().unwrap().push(id);
        }
        fn on_connect(&self, _id: PeerId, _remote: SocketAddr) {}
    }

    #[tokio::test]
    async fn silent_connection_dropped_after_one_missed_ping() {
        let cancel = CancellationToken::new();
        let closes = Arc::new(Closes::default());
        let listener = Arc::new(Listener::new(
            Arc::new(BincodeCodec),
            closes.clone(),
            &cancel,
        ));
        let port = listener.start(0).await.unwrap().port();
        let _silent = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        for _ in 0..100 {
            if !listener.connection_ids().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let id = listener.connection_ids()[0];

        let ponged = DashMap::new();
        beat(&listener, &ponged);
        assert_eq!(ponged.get(&id).map(|v| *v), Some(false));
        beat(&listener, &ponged);
        assert!(listener.connection_ids().is_empty());
        assert_eq!(*closes.0.lock().unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn answered_connection_survives() {
        let cancel = CancellationToken::new();
        let closes = Arc::new(Closes::default());
        let listener = Arc::new(Listener::new(
            Arc::new(BincodeCodec),
            closes.clone(),
            &cancel,
        ));
        let port = listener.start(0).await.unwrap().port();
        let _peer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        for _ in 0..100 {
            if !listener.connection_ids().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let id = listener.connection_ids()[0];

        let monitor = HeartbeatMonitor {
            ponged: Arc::new(DashMap::new()),
            cancel: cancel.child_token(),
        };
        beat(&listener, &monitor.ponged);
        monitor.mark_alive(id);
        beat(&listener, &monitor.ponged);
        assert_eq!(listener.connection_ids(), vec![id]);
        assert!(closes.0.lock().unwrap().is_empty());
    }
}
