//! Concurrent peer registry keyed by identity.
//!
//! Read and written from every connection's read loop at once. Each record
//! carries the sequence number of its first insertion so snapshots come back
//! in first-contact order. Removing an absent id is a no-op.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::identity::PeerId;
use crate::peer::Peer;

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    peer: Peer,
}

#[derive(Debug, Default)]
pub struct PeerRegistry {
    entries: DashMap<PeerId, Entry>,
    next_seq: AtomicU64,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &PeerId) -> Option<Peer> {
        self.entries.get(id).map(|e| e.peer.clone())
    }

    /// Insert or replace the record for `peer.id()`. Returns true if the id was new.
    pub fn upsert(&self, peer: Peer) -> bool {
        let id = peer.id();
        match self.entries.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(mut e) => {
                e.get_mut().peer = peer;
                false
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                e.insert(Entry { seq, peer });
                true
            }
        }
    }

    pub fn remove(&self, id: &PeerId) -> Option<Peer> {
        self.entries.remove(id).map(|(_, e)| e.peer)
    }

    /// Host-side correction of an existing record. `f` sees the current record and
    /// returns the replacement, or `None` to leave it untouched. Runs under the
    /// entry's lock, so `f` must not call back into the registry.
    pub fn host_update(&self, id: &PeerId, f: impl FnOnce(&Peer) -> Option<Peer>) -> Option<Peer> {
        let mut entry = self.entries.get_mut(id)?;
        let next = f(&entry.peer)?;
        entry.peer = next.clone();
        Some(next)
    }

    /// Copy of every record in first-insertion order.
    pub fn snapshot(&self) -> Vec<Peer> {
        let mut all: Vec<Entry> = self.entries.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|e| e.seq);
        all.into_iter().map(|e| e.peer).collect()
    }

    /// Connected records only, in first-insertion order.
    pub fn connected(&self) -> Vec<Peer> {
        self.snapshot()
            .into_iter()
            .filter(|p| p.is_connected())
            .collect()
    }

    /// Replace the whole registry with `peers`, keeping the original order of ids
    /// that survive. Returns the previous snapshot.
    pub fn replace_all(&self, peers: impl IntoIterator<Item = Peer>) -> Vec<Peer> {
        let previous = self.snapshot();
        let incoming: Vec<Peer> = peers.into_iter().collect();
        self.entries
            .retain(|id, _| incoming.iter().any(|p| p.id() == *id));
        for peer in incoming {
            self.upsert(peer);
        }
        previous
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
