//! Choice of the next gossip partner.

use hashweave_protocol::{Peer, PeerId, PeerSet};
use rand::seq::SliceRandom;
use std::collections::HashSet;

/// Random selection that skips the local node, peers with a sync already in
/// flight, and, when there is a choice, the previous partner.
#[derive(Debug)]
pub struct PeerSelector {
    local_id: PeerId,
    last: Option<PeerId>,
    in_flight: HashSet<PeerId>,
}

impl PeerSelector {
    pub fn new(local_id: PeerId) -> Self {
        Self {
            local_id,
            last: None,
            in_flight: HashSet::new(),
        }
    }

    /// Pick a partner from `peers` and mark it in flight.
    pub fn next(&mut self, peers: &PeerSet) -> Option<(PeerId, Peer)> {
        let candidates: Vec<(PeerId, &Peer)> = peers
            .peers()
            .filter(|(id, _)| **id != self.local_id && !self.in_flight.contains(*id))
            .map(|(id, peer)| (*id, peer))
            .collect();

        let preferred: Vec<(PeerId, &Peer)> = if candidates.len() > 1 {
            candidates
                .iter()
                .filter(|(id, _)| Some(*id) != self.last)
                .copied()
                .collect()
        } else {
            candidates
        };

        let (id, peer) = preferred.choose(&mut rand::thread_rng()).copied()?;
        self.in_flight.insert(id);
        self.last = Some(id);
        Some((id, peer.clone()))
    }

    /// Release a partner picked by [`PeerSelector::next`].
    pub fn finish(&mut self, id: PeerId) {
        self.in_flight.remove(&id);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashweave_protocol::{KeyPair, Signer};

    fn peer_set(n: usize) -> (Vec<KeyPair>, PeerSet) {
        let keys: Vec<KeyPair> = (0..n).map(|_| KeyPair::generate()).collect();
        let peers = keys
            .iter()
            .enumerate()
            .map(|(i, k)| Peer::new(k.public_key_hex(), format!("addr{}", i), format!("node{}", i)))
            .collect();
        (keys, PeerSet::new(peers).unwrap())
    }

    #[test]
    fn test_never_selects_self_or_in_flight() {
        let (keys, peers) = peer_set(3);
        let me = keys[0].peer_id();
        let mut selector = PeerSelector::new(me);

        let (first, _) = selector.next(&peers).unwrap();
        let (second, _) = selector.next(&peers).unwrap();
        assert_ne!(first, me);
        assert_ne!(second, me);
        assert_ne!(first, second);
        assert!(selector.next(&peers).is_none());

        selector.finish(first);
        assert_eq!(selector.next(&peers).unwrap().0, first);
    }

    #[test]
    fn test_avoids_previous_partner_when_possible() {
        let (keys, peers) = peer_set(3);
        let mut selector = PeerSelector::new(keys[0].peer_id());
        let (previous, _) = selector.next(&peers).unwrap();
        selector.finish(previous);
        for _ in 0..10 {
            let (id, _) = selector.next(&peers).unwrap();
            assert_ne!(id, previous);
            selector.finish(id);
            // alternate between the two others
            let (back, _) = selector.next(&peers).unwrap();
            assert_eq!(back, previous);
            selector.finish(back);
        }
    }

    #[test]
    fn test_alone_has_no_partner() {
        let (keys, peers) = peer_set(1);
        let mut selector = PeerSelector::new(keys[0].peer_id());
        assert!(selector.next(&peers).is_none());
    }
}
