//! Storage contract for the hashgraph and its in-memory implementation.
//!
//! The [`Store`] trait is the seam between consensus and persistence. The
//! consensus code only ever talks to a `Box<dyn Store>`; [`InmemStore`] keeps
//! everything in maps and [`crate::sled_store::SledStore`] adds durability on
//! top of it.

use hashweave_protocol::{
    Block, Event, EventHash, Frame, KnownIndexes, Peer, PeerId, PeerSet,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::errors::StoreError;
use crate::round::RoundInfo;

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Persistence backend for events, rounds, blocks, frames and peer sets.
pub trait Store: Send {
    // Events

    /// Fetch an event; `KeyNotFound` when absent.
    fn get_event(&self, hash: &EventHash) -> StoreResult<Arc<Event>>;

    fn has_event(&self, hash: &EventHash) -> bool;

    /// Insert an event or replace the stored copy (metadata updates).
    fn set_event(&mut self, event: Event) -> StoreResult<()>;

    /// Hash of the event `creator` signed at `index`, if stored.
    fn participant_event(&self, creator: PeerId, index: i64) -> Option<EventHash>;

    /// Hashes of `creator`'s events with index greater than `after`, ascending.
    fn participant_events(&self, creator: PeerId, after: i64) -> Vec<EventHash>;

    fn last_event_from(&self, creator: PeerId) -> Option<(EventHash, i64)>;

    /// Highest stored index per creator.
    fn known_events(&self) -> KnownIndexes;

    fn event_count(&self) -> usize;

    /// Every stored event, in no particular order.
    fn all_events(&self) -> Vec<Arc<Event>>;

    // Equivocation evidence

    /// Record a conflicting event and flag its creator.
    fn add_evidence(&mut self, event: Event) -> StoreResult<()>;

    fn evidence(&self) -> Vec<Event>;

    fn has_evidence(&self, hash: &EventHash) -> bool;

    fn get_evidence(&self, hash: &EventHash) -> Option<Event>;

    fn faulty_creators(&self) -> BTreeSet<PeerId>;

    // Rounds and consensus order

    fn get_round(&self, round: i64) -> Option<RoundInfo>;

    fn set_round(&mut self, round: i64, info: RoundInfo) -> StoreResult<()>;

    /// Drop round records at or above `round`.
    fn remove_rounds_from(&mut self, round: i64) -> StoreResult<()>;

    /// Highest round with a record, -1 if none.
    fn last_round(&self) -> i64;

    fn add_consensus_event(&mut self, hash: EventHash) -> StoreResult<()>;

    fn consensus_events(&self) -> Vec<EventHash>;

    fn consensus_event_count(&self) -> usize;

    // Blocks and frames

    fn get_block(&self, index: u64) -> Option<Block>;

    fn set_block(&mut self, block: Block) -> StoreResult<()>;

    fn last_block_index(&self) -> Option<u64>;

    fn get_frame(&self, round: i64) -> Option<Frame>;

    fn set_frame(&mut self, frame: Frame) -> StoreResult<()>;

    // Peer sets

    /// Register the peer set taking effect at `round`.
    fn set_peer_set(&mut self, round: i64, peers: PeerSet) -> StoreResult<()>;

    /// Peer set in force at `round`: the latest one effective at or before it.
    fn peer_set_for_round(&self, round: i64) -> Option<PeerSet>;

    /// Every registered peer set, keyed by effective round.
    fn peer_sets(&self) -> BTreeMap<i64, PeerSet>;

    /// Any peer that was ever part of a registered peer set.
    fn repertoire_peer(&self, id: PeerId) -> Option<Peer>;

    // Lifecycle

    /// Forget the DAG and restart from a frame's peer-set history.
    fn reset(&mut self, frame: &Frame) -> StoreResult<()>;

    fn close(&mut self) -> StoreResult<()>;
}

/// Map-backed [`Store`].
#[derive(Debug, Default, Clone)]
pub struct InmemStore {
    events: HashMap<EventHash, Arc<Event>>,
    participants: BTreeMap<PeerId, BTreeMap<i64, EventHash>>,
    evidence: BTreeMap<EventHash, Event>,
    faulty: BTreeSet<PeerId>,
    rounds: BTreeMap<i64, RoundInfo>,
    consensus: Vec<EventHash>,
    blocks: BTreeMap<u64, Block>,
    frames: BTreeMap<i64, Frame>,
    peer_sets: BTreeMap<i64, PeerSet>,
    repertoire: BTreeMap<PeerId, Peer>,
}

impl InmemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with the genesis peer set at round 0.
    pub fn with_genesis(peers: PeerSet) -> Self {
        let mut store = Self::new();
        store.insert_peer_set(0, peers);
        store
    }

    fn insert_peer_set(&mut self, round: i64, peers: PeerSet) {
        for (id, peer) in peers.peers() {
            self.repertoire.entry(*id).or_insert_with(|| peer.clone());
        }
        self.peer_sets.insert(round, peers);
    }
}

impl Store for InmemStore {
    fn get_event(&self, hash: &EventHash) -> StoreResult<Arc<Event>> {
        self.events
            .get(hash)
            .cloned()
            .ok_or_else(|| StoreError::KeyNotFound {
                key: format!("event {}", hash.to_hex()),
            })
    }

    fn has_event(&self, hash: &EventHash) -> bool {
        self.events.contains_key(hash)
    }

    fn set_event(&mut self, event: Event) -> StoreResult<()> {
        let hash = event.hash();
        self.participants
            .entry(event.creator_id())
            .or_default()
            .entry(event.index())
            .or_insert(hash);
        self.events.insert(hash, Arc::new(event));
        Ok(())
    }

    fn participant_event(&self, creator: PeerId, index: i64) -> Option<EventHash> {
        self.participants
            .get(&creator)
            .and_then(|chain| chain.get(&index))
            .copied()
    }

    fn participant_events(&self, creator: PeerId, after: i64) -> Vec<EventHash> {
        match self.participants.get(&creator) {
            Some(chain) => chain
                .range(after.saturating_add(1)..)
                .map(|(_, hash)| *hash)
                .collect(),
            None => Vec::new(),
        }
    }

    fn last_event_from(&self, creator: PeerId) -> Option<(EventHash, i64)> {
        self.participants
            .get(&creator)
            .and_then(|chain| chain.iter().next_back())
            .map(|(index, hash)| (*hash, *index))
    }

    fn known_events(&self) -> KnownIndexes {
        let mut known = KnownIndexes::new();
        for id in self.repertoire.keys() {
            known.insert(*id, -1);
        }
        for (creator, chain) in &self.participants {
            if let Some((index, _)) = chain.iter().next_back() {
                known.insert(*creator, *index);
            }
        }
        known
    }

    fn event_count(&self) -> usize {
        self.events.len()
    }

    fn all_events(&self) -> Vec<Arc<Event>> {
        self.events.values().cloned().collect()
    }

    fn add_evidence(&mut self, event: Event) -> StoreResult<()> {
        self.faulty.insert(event.creator_id());
        self.evidence.insert(event.hash(), event);
        Ok(())
    }

    fn evidence(&self) -> Vec<Event> {
        self.evidence.values().cloned().collect()
    }

    fn has_evidence(&self, hash: &EventHash) -> bool {
        self.evidence.contains_key(hash)
    }

    fn get_evidence(&self, hash: &EventHash) -> Option<Event> {
        self.evidence.get(hash).cloned()
    }

    fn faulty_creators(&self) -> BTreeSet<PeerId> {
        self.faulty.clone()
    }

    fn get_round(&self, round: i64) -> Option<RoundInfo> {
        self.rounds.get(&round).cloned()
    }

    fn set_round(&mut self, round: i64, info: RoundInfo) -> StoreResult<()> {
        self.rounds.insert(round, info);
        Ok(())
    }

    fn remove_rounds_from(&mut self, round: i64) -> StoreResult<()> {
        self.rounds.split_off(&round);
        Ok(())
    }

    fn last_round(&self) -> i64 {
        self.rounds.keys().next_back().copied().unwrap_or(-1)
    }

    fn add_consensus_event(&mut self, hash: EventHash) -> StoreResult<()> {
        self.consensus.push(hash);
        Ok(())
    }

    fn consensus_events(&self) -> Vec<EventHash> {
        self.consensus.clone()
    }

    fn consensus_event_count(&self) -> usize {
        self.consensus.len()
    }

    fn get_block(&self, index: u64) -> Option<Block> {
        self.blocks.get(&index).cloned()
    }

    fn set_block(&mut self, block: Block) -> StoreResult<()> {
        self.blocks.insert(block.index(), block);
        Ok(())
    }

    fn last_block_index(&self) -> Option<u64> {
        self.blocks.keys().next_back().copied()
    }

    fn get_frame(&self, round: i64) -> Option<Frame> {
        self.frames.get(&round).cloned()
    }

    fn set_frame(&mut self, frame: Frame) -> StoreResult<()> {
        self.frames.insert(frame.round, frame);
        Ok(())
    }

    fn set_peer_set(&mut self, round: i64, peers: PeerSet) -> StoreResult<()> {
        self.insert_peer_set(round, peers);
        Ok(())
    }

    fn peer_set_for_round(&self, round: i64) -> Option<PeerSet> {
        self.peer_sets
            .range(..=round)
            .next_back()
            .or_else(|| self.peer_sets.iter().next())
            .map(|(_, peers)| peers.clone())
    }

    fn peer_sets(&self) -> BTreeMap<i64, PeerSet> {
        self.peer_sets.clone()
    }

    fn repertoire_peer(&self, id: PeerId) -> Option<Peer> {
        self.repertoire.get(&id).cloned()
    }

    fn reset(&mut self, frame: &Frame) -> StoreResult<()> {
        *self = InmemStore::new();
        for (round, peers) in &frame.peer_sets {
            self.insert_peer_set(*round, peers.clone());
        }
        Ok(())
    }

    fn close(&mut self) -> StoreResult<()> {
        Ok(())
    }
}
