//! Validated event storage and ancestry queries.
//!
//! [`EventStore`] enforces the structural rules of the DAG on top of a raw
//! [`Store`]: signatures, parent presence, consecutive creator indexes and
//! equivocation. It also maintains the `last_ancestors` and
//! `first_descendants` coordinates that make ancestry checks constant time.

use hashweave_protocol::{Event, EventHash, KnownIndexes, PeerId, PeerSet};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::errors::HashgraphError;
use crate::store::Store;

/// Result of a successful insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The event was new and is now part of the DAG
    Inserted(EventHash),
    /// The event was already stored; nothing changed
    Duplicate(EventHash),
}

impl InsertOutcome {
    pub fn hash(&self) -> EventHash {
        match self {
            InsertOutcome::Inserted(hash) | InsertOutcome::Duplicate(hash) => *hash,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, InsertOutcome::Inserted(_))
    }
}

/// DAG of signed events.
pub struct EventStore {
    backend: Box<dyn Store>,
}

impl EventStore {
    pub fn new(backend: Box<dyn Store>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &dyn Store {
        self.backend.as_ref()
    }

    pub fn backend_mut(&mut self) -> &mut dyn Store {
        self.backend.as_mut()
    }

    /// Validate and insert an event.
    ///
    /// Inserting an event that is already stored is a no-op. A second event
    /// at an existing `(creator, index)` is kept as evidence only and the
    /// creator is flagged faulty.
    pub fn insert(&mut self, event: Event) -> Result<InsertOutcome, HashgraphError> {
        let hash = event.hash();
        if self.backend.has_event(&hash) || self.backend.has_evidence(&hash) {
            return Ok(InsertOutcome::Duplicate(hash));
        }

        if !event.verify()? {
            return Err(HashgraphError::invalid(format!(
                "bad signature on event {:?}",
                hash
            )));
        }

        let creator = event.creator_id();
        if self.backend.repertoire_peer(creator).is_none() {
            return Err(HashgraphError::invalid(format!(
                "creator {} is not a known peer",
                creator
            )));
        }

        let self_parent = match event.self_parent() {
            Some(sp) => {
                let parent = self.parent(&sp, "self-parent")?;
                if parent.creator_id() != creator {
                    return Err(HashgraphError::invalid(
                        "self-parent belongs to another creator",
                    ));
                }
                if parent.index() + 1 != event.index() {
                    return Err(HashgraphError::invalid(format!(
                        "index {} does not follow self-parent index {}",
                        event.index(),
                        parent.index()
                    )));
                }
                if !self.backend.has_event(&sp) {
                    // a fork keeps growing on the evidence side
                    let index = event.index();
                    warn!("⚠️ {} extends a forked chain at index {}", creator, index);
                    self.backend.add_evidence(event.stripped())?;
                    return Err(HashgraphError::EquivocationDetected { creator, index });
                }
                Some(parent)
            }
            None => {
                if event.index() != 0 {
                    return Err(HashgraphError::invalid(format!(
                        "event at index {} has no self-parent",
                        event.index()
                    )));
                }
                None
            }
        };

        let other_lineage = match event.other_parent() {
            Some(op) => {
                let parent = self.parent(&op, "other-parent")?;
                if parent.creator_id() == creator {
                    return Err(HashgraphError::invalid(
                        "other-parent must come from another creator",
                    ));
                }
                self.lineage(&op)?
            }
            None => Vec::new(),
        };

        if let Some(existing) = self.backend.participant_event(creator, event.index()) {
            if existing != hash {
                warn!(
                    "⚠️ Equivocation by {} at index {}: {:?} vs {:?}",
                    creator,
                    event.index(),
                    existing,
                    hash
                );
                let index = event.index();
                self.backend.add_evidence(event.stripped())?;
                return Err(HashgraphError::EquivocationDetected { creator, index });
            }
        }

        let mut event = event.stripped();
        let parents: Vec<&Arc<Event>> = self_parent.iter().chain(other_lineage.iter()).collect();
        event.meta.lamport_timestamp = parents
            .iter()
            .map(|p| p.meta.lamport_timestamp + 1)
            .max()
            .unwrap_or(0);
        for parent in &parents {
            for (peer, index) in &parent.meta.last_ancestors {
                let entry = event.meta.last_ancestors.entry(*peer).or_insert(*index);
                if *entry < *index {
                    *entry = *index;
                }
            }
        }
        event.meta.last_ancestors.insert(creator, event.index());
        event.meta.first_descendants.insert(creator, event.index());

        let last_ancestors = event.meta.last_ancestors.clone();
        let index = event.index();
        self.backend.set_event(event)?;
        self.update_first_descendants(creator, index, &last_ancestors)?;

        debug!("Inserted event {:?} ({} #{})", hash, creator, index);
        Ok(InsertOutcome::Inserted(hash))
    }

    /// Insert an event from a trusted snapshot, keeping its metadata.
    ///
    /// Only the signature is checked; parents may lie outside the snapshot.
    pub fn insert_trusted(&mut self, event: Event) -> Result<EventHash, HashgraphError> {
        let hash = event.hash();
        if !event.verify()? {
            return Err(HashgraphError::SnapshotMismatch {
                reason: format!("bad signature on frame event {:?}", hash),
            });
        }
        if self.backend.has_event(&hash) {
            return Ok(hash);
        }
        self.backend.set_event(event)?;
        Ok(hash)
    }

    /// Replace the stored copy of an event, typically to update metadata.
    pub fn update(&mut self, event: Event) -> Result<(), HashgraphError> {
        self.backend.set_event(event)?;
        Ok(())
    }

    /// Walk back along each ancestor chain and mark the new event as the first
    /// descendant from `creator` wherever none is recorded yet.
    fn update_first_descendants(
        &mut self,
        creator: PeerId,
        index: i64,
        last_ancestors: &KnownIndexes,
    ) -> Result<(), HashgraphError> {
        for (peer, top) in last_ancestors {
            if *peer == creator {
                continue;
            }
            let mut cursor = *top;
            while cursor >= 0 {
                let Some(hash) = self.backend.participant_event(*peer, cursor) else {
                    break;
                };
                let ancestor = self.backend.get_event(&hash)?;
                if ancestor.meta.first_descendants.contains_key(&creator) {
                    break;
                }
                let mut updated = (*ancestor).clone();
                updated.meta.first_descendants.insert(creator, index);
                self.backend.set_event(updated)?;
                cursor -= 1;
            }
        }
        Ok(())
    }

    /// A parent from the DAG or from the equivocation evidence.
    fn parent(&self, hash: &EventHash, what: &str) -> Result<Arc<Event>, HashgraphError> {
        self.get_any(hash)
            .ok_or_else(|| HashgraphError::invalid(format!("{} {:?} not found", what, hash)))
    }

    /// Look an event up in the DAG first, then in the evidence.
    pub fn get_any(&self, hash: &EventHash) -> Option<Arc<Event>> {
        self.backend
            .get_event(hash)
            .ok()
            .or_else(|| self.backend.get_evidence(hash).map(Arc::new))
    }

    /// DAG events standing in for `hash` in ancestry: the event itself, or
    /// for evidence the nearest DAG events below it. Evidence contributes no
    /// ancestry of its own.
    fn lineage(&self, hash: &EventHash) -> Result<Vec<Arc<Event>>, HashgraphError> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![*hash];
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            if self.backend.has_event(&current) {
                out.push(self.get(&current)?);
            } else if let Some(evidence) = self.backend.get_evidence(&current) {
                stack.extend(evidence.self_parent());
                stack.extend(evidence.other_parent());
            }
        }
        Ok(out)
    }

    pub fn get(&self, hash: &EventHash) -> Result<Arc<Event>, HashgraphError> {
        Ok(self.backend.get_event(hash)?)
    }

    pub fn contains(&self, hash: &EventHash) -> bool {
        self.backend.has_event(hash)
    }

    /// Highest stored index per known creator, -1 for creators without events.
    pub fn known_indexes(&self) -> KnownIndexes {
        self.backend.known_events()
    }

    /// Every stored ancestor of `hash`, excluding itself, nearest first.
    pub fn ancestors(&self, hash: &EventHash) -> Result<Vec<EventHash>, HashgraphError> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut queue = VecDeque::new();
        queue.push_back(*hash);
        while let Some(current) = queue.pop_front() {
            let event = self.get(&current)?;
            for parent in [event.self_parent(), event.other_parent()].into_iter().flatten() {
                if self.contains(&parent) && seen.insert(parent) {
                    out.push(parent);
                    queue.push_back(parent);
                }
            }
        }
        Ok(out)
    }

    /// The self-parent chain of `hash`, nearest first.
    pub fn self_ancestors(&self, hash: &EventHash) -> Result<Vec<EventHash>, HashgraphError> {
        let mut out = Vec::new();
        let mut current = self.get(hash)?.self_parent();
        while let Some(parent) = current {
            if !self.contains(&parent) {
                break;
            }
            out.push(parent);
            current = self.get(&parent)?.self_parent();
        }
        Ok(out)
    }

    pub fn faulty_creators(&self) -> BTreeSet<PeerId> {
        self.backend.faulty_creators()
    }

    pub fn evidence(&self) -> Vec<Event> {
        self.backend.evidence()
    }
}

/// `x` has `y` as an ancestor (or is `y`).
pub fn see(x: &Event, y: &Event) -> bool {
    x.meta
        .last_ancestors
        .get(&y.creator_id())
        .map_or(false, |index| *index >= y.index())
}

/// `x` reaches `y` through events of creators holding a supermajority of
/// `peers`' stake.
pub fn strongly_see(x: &Event, y: &Event, peers: &PeerSet) -> bool {
    let mut stake = 0;
    for (id, peer) in peers.peers() {
        let reached = match (x.meta.last_ancestors.get(id), y.meta.first_descendants.get(id)) {
            (Some(last), Some(first)) => last >= first,
            _ => false,
        };
        if reached {
            stake += peer.stake;
        }
    }
    stake >= peers.super_majority()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InmemStore;
    use chrono::Utc;
    use hashweave_protocol::{KeyPair, Peer, Signer};

    fn create_test_peers(n: usize) -> (Vec<KeyPair>, PeerSet) {
        let keys: Vec<KeyPair> = (0..n).map(|_| KeyPair::generate()).collect();
        let peers = PeerSet::new(
            keys.iter()
                .enumerate()
                .map(|(i, k)| Peer::new(k.public_key_hex(), format!("addr{}", i), format!("node{}", i)))
                .collect(),
        )
        .unwrap();
        (keys, peers)
    }

    fn make_event(
        key: &KeyPair,
        index: i64,
        self_parent: Option<EventHash>,
        other_parent: Option<EventHash>,
        payload: &[u8],
    ) -> Event {
        let mut event = Event::new(
            vec![payload.to_vec()],
            vec![],
            vec![],
            self_parent,
            other_parent,
            key.public_key_hex(),
            index,
            Utc::now(),
        );
        event.sign(key).unwrap();
        event
    }

    fn test_store(peers: PeerSet) -> EventStore {
        EventStore::new(Box::new(InmemStore::with_genesis(peers)))
    }

    #[test]
    fn test_insert_and_coordinates() {
        let (keys, peers) = create_test_peers(3);
        let mut store = test_store(peers);

        let a0 = make_event(&keys[0], 0, None, None, b"a0");
        let b0 = make_event(&keys[1], 0, None, None, b"b0");
        let (a0h, b0h) = (a0.hash(), b0.hash());
        assert!(store.insert(a0).unwrap().is_new());
        store.insert(b0).unwrap();

        let b1 = make_event(&keys[1], 1, Some(b0h), Some(a0h), b"b1");
        let b1h = b1.hash();
        store.insert(b1).unwrap();

        let b1 = store.get(&b1h).unwrap();
        assert_eq!(b1.meta.lamport_timestamp, 1);
        assert_eq!(b1.meta.last_ancestors.get(&keys[0].peer_id()), Some(&0));
        assert_eq!(b1.meta.last_ancestors.get(&keys[1].peer_id()), Some(&1));

        let a0 = store.get(&a0h).unwrap();
        assert_eq!(a0.meta.first_descendants.get(&keys[1].peer_id()), Some(&1));
        assert!(see(&b1, &a0));
        assert!(!see(&a0, &b1));

        assert_eq!(store.ancestors(&b1h).unwrap().len(), 2);
        assert_eq!(store.self_ancestors(&b1h).unwrap(), vec![b0h]);
    }

    #[test]
    fn test_duplicate_is_idempotent() {
        let (keys, peers) = create_test_peers(2);
        let mut store = test_store(peers);

        let a0 = make_event(&keys[0], 0, None, None, b"a0");
        store.insert(a0.clone()).unwrap();
        let outcome = store.insert(a0).unwrap();
        assert!(!outcome.is_new());
        assert_eq!(store.backend().event_count(), 1);
    }

    #[test]
    fn test_rejects_bad_index_and_missing_parent() {
        let (keys, peers) = create_test_peers(2);
        let mut store = test_store(peers);

        let a0 = make_event(&keys[0], 0, None, None, b"a0");
        let a0h = a0.hash();
        store.insert(a0).unwrap();

        let skipped = make_event(&keys[0], 2, Some(a0h), None, b"a2");
        assert!(matches!(store.insert(skipped), Err(HashgraphError::InvalidEvent { .. })));

        let orphan = make_event(&keys[0], 1, Some(EventHash([7; 32])), None, b"x");
        assert!(matches!(store.insert(orphan), Err(HashgraphError::InvalidEvent { .. })));

        let rootless = make_event(&keys[1], 3, None, None, b"b3");
        assert!(matches!(store.insert(rootless), Err(HashgraphError::InvalidEvent { .. })));
    }

    #[test]
    fn test_rejects_forged_and_unknown_creator() {
        let (keys, peers) = create_test_peers(2);
        let mut store = test_store(peers);

        let mut forged = make_event(&keys[0], 0, None, None, b"a0");
        forged.signature = keys[1].sign(&forged.hash().0);
        assert!(matches!(store.insert(forged), Err(HashgraphError::InvalidEvent { .. })));

        let stranger = KeyPair::generate();
        let foreign = make_event(&stranger, 0, None, None, b"s0");
        assert!(matches!(store.insert(foreign), Err(HashgraphError::InvalidEvent { .. })));
    }

    #[test]
    fn test_equivocation_kept_as_evidence() {
        let (keys, peers) = create_test_peers(2);
        let mut store = test_store(peers);

        let a0 = make_event(&keys[0], 0, None, None, b"first");
        let a0h = a0.hash();
        store.insert(a0).unwrap();

        let fork = make_event(&keys[0], 0, None, None, b"second");
        let err = store.insert(fork.clone()).unwrap_err();
        assert!(matches!(err, HashgraphError::EquivocationDetected { index: 0, .. }));

        assert!(store.faulty_creators().contains(&keys[0].peer_id()));
        assert_eq!(store.evidence().len(), 1);
        assert_eq!(store.backend().participant_event(keys[0].peer_id(), 0), Some(a0h));
        assert!(!store.contains(&fork.hash()));

        // receiving the same conflicting event again changes nothing
        assert!(!store.insert(fork).unwrap().is_new());
    }

    #[test]
    fn test_strongly_see_threshold() {
        // four validators: a supermajority is three
        let (keys, peers) = create_test_peers(4);
        let mut store = test_store(peers.clone());

        let a0 = make_event(&keys[0], 0, None, None, b"a0");
        let b0 = make_event(&keys[1], 0, None, None, b"b0");
        let c0 = make_event(&keys[2], 0, None, None, b"c0");
        let (a0h, b0h, c0h) = (a0.hash(), b0.hash(), c0.hash());
        for e in [a0, b0, c0] {
            store.insert(e).unwrap();
        }

        // b1 sees a0 but only A and B lie on the paths
        let b1 = make_event(&keys[1], 1, Some(b0h), Some(a0h), b"b1");
        let b1h = b1.hash();
        store.insert(b1).unwrap();
        let a0e = store.get(&a0h).unwrap();
        assert!(!strongly_see(&store.get(&b1h).unwrap(), &a0e, &peers));

        // c1 learns b1, so the paths to a0 now cross A, B and C
        let c1 = make_event(&keys[2], 1, Some(c0h), Some(b1h), b"c1");
        let c1h = c1.hash();
        store.insert(c1).unwrap();
        let a0e = store.get(&a0h).unwrap();
        assert!(strongly_see(&store.get(&c1h).unwrap(), &a0e, &peers));
    }
}
