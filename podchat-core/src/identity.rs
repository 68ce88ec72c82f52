//! Peer identities: reserved ids, fresh id allocation, election jitter.

use std::time::Duration;

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Peer identity. Unique per session.
pub type PeerId = Uuid;

/// Reserved all-zero id: the host itself.
pub const HOST_ID: PeerId = Uuid::nil();

/// Reserved all-ones id: broadcast, or no specific recipient.
pub const BROADCAST_ID: PeerId = Uuid::from_bytes([0xff; 16]);

/// True for the two ids that must never be assigned to a real peer.
pub fn is_reserved(id: &PeerId) -> bool {
    *id == HOST_ID || *id == BROADCAST_ID
}

/// Generate a random id that is neither reserved nor taken.
pub fn fresh_peer_id(mut is_taken: impl FnMut(&PeerId) -> bool) -> PeerId {
    loop {
        let id = Uuid::new_v4();
        if !is_reserved(&id) && !is_taken(&id) {
            return id;
        }
    }
}

/// Delay before re-entering election, derived from the previous identity.
/// Deterministic per id; linearly mapped into `[0, max]`.
pub fn election_delay(previous: &PeerId, max: Duration) -> Duration {
    let digest = Sha256::digest(previous.as_bytes());
    let hash = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
    let max_ms = max.as_millis();
    let ms = (hash as u128 * max_ms) / u32::MAX as u128;
    Duration::from_millis(ms as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_ids_are_distinct() {
        assert_ne!(HOST_ID, BROADCAST_ID);
        assert!(is_reserved(&HOST_ID));
        assert!(is_reserved(&BROADCAST_ID));
        assert!(!is_reserved(&Uuid::new_v4()));
        assert!(BROADCAST_ID.as_bytes().iter().all(|b| *b == 0xff));
    }

    #[test]
    fn fresh_id_skips_taken() {
        let mut rejected = 0;
        let id = fresh_peer_id(|_| {
            rejected += 1;
            rejected < 3
        });
        assert_eq!(rejected, 3);
        assert!(!is_reserved(&id));
    }

    #[test]
    fn election_delay_is_deterministic_and_bounded() {
        let max = Duration::from_millis(1500);
        for _ in 0..64 {
            let id = Uuid::new_v4();
            let d = election_delay(&id, max);
            assert!(d <= max);
            assert_eq!(d, election_delay(&id, max));
        }
        assert_eq!(election_delay(&HOST_ID, Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn election_delay_spreads_ids() {
        let max = Duration::from_millis(1500);
        let delays: std::collections::HashSet<Duration> = (0..32)
            .map(|_| election_delay(&Uuid::new_v4(), max))
            .collect();
        assert!(delays.len() > 1);
    }
}
