//! Shared helpers for podchat-node integration tests.

#![allow(dead_code)]

use std::time::Duration;

use podchat_core::{PeerId, HOST_ID};
use podchat_node::{Coordinator, CoordinatorOptions};
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Upper bound for anything that should happen "soon".
pub const WAIT: Duration = Duration::from_secs(10);

/// A port nothing is listening on right now.
pub fn free_port() -> u16 {
    let l = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    l.local_addr().expect("local addr").port()
}

/// Options for a node on `port` that falls back to localhost.
pub fn options(port: u16, name: Option<&str>) -> CoordinatorOptions {
    CoordinatorOptions {
        port,
        host: Some("127.0.0.1".to_string()),
        name: name.map(str::to_string),
        ..CoordinatorOptions::default()
    }
}

/// Start a node and wait for it to take a role.
pub async fn start(port: u16, name: Option<&str>) -> Coordinator {
    let c = Coordinator::new(options(port, name));
    c.begin().await.expect("begin");
    c
}

/// Start a node that must join as a client, and wait until its handshake completes.
pub async fn join(port: u16, name: Option<&str>) -> Coordinator {
    let c = start(port, name).await;
    assert!(!c.is_host(), "expected to join as client");
    assert!(eventually(|| c.own_identity().is_some()).await, "handshake");
    c
}

/// Poll `cond` until it holds or [`WAIT`] elapses.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

/// Next event matching `pred`, or `None` after [`WAIT`].
pub async fn recv_matching<T: Clone>(
    rx: &mut broadcast::Receiver<T>,
    mut pred: impl FnMut(&T) -> bool,
) -> Option<T> {
    let deadline = Instant::now() + WAIT;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(v)) if pred(&v) => return Some(v),
            Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            _ => return None,
        }
    }
}

/// Id of the connected peer called `name` in `c`'s registry.
pub fn peer_named(c: &Coordinator, name: &str) -> Option<PeerId> {
    c.peers()
        .into_iter()
        .find(|p| p.is_connected() && p.name() == name)
        .map(|p| p.id())
}

/// True once `c` sees exactly `n` connected peers, the host among them.
pub fn synced(c: &Coordinator, n: usize) -> bool {
    let peers = c.peers();
    peers.len() == n
        && peers.iter().all(|p| p.is_connected())
        && peers.iter().any(|p| p.id() == HOST_ID)
}
