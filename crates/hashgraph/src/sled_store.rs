//! Persistent [`Store`] backed by sled.
//!
//! Every write goes to both an [`InmemStore`] cache and a sled tree; reads are
//! served from the cache. Opening an existing database reloads the cache so a
//! restarted node can bootstrap its hashgraph from disk.

use hashweave_protocol::{Block, Event, EventHash, Frame, KnownIndexes, Peer, PeerId, PeerSet};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Db, Tree};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::errors::StoreError;
use crate::round::RoundInfo;
use crate::store::{InmemStore, Store, StoreResult};

/// sled-backed store with a write-through cache
pub struct SledStore {
    /// Main database
    db: Db,
    /// Events tree (event hash -> Event)
    events: Tree,
    /// Evidence tree (event hash -> conflicting Event)
    evidence: Tree,
    /// Rounds tree (round -> RoundInfo)
    rounds: Tree,
    /// Consensus tree (position -> event hash)
    consensus: Tree,
    /// Blocks tree (index -> Block)
    blocks: Tree,
    /// Frames tree (round -> Frame)
    frames: Tree,
    /// Peer sets tree (effective round -> PeerSet)
    peer_sets: Tree,
    /// Cached copy of everything above
    cache: InmemStore,
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StoreError::SerializationError { source: e })
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::SerializationError { source: e })
}

fn round_key(round: i64) -> [u8; 8] {
    // Offset so negative rounds still sort before non-negative ones.
    ((round as u64) ^ (1 << 63)).to_be_bytes()
}

fn round_from_key(key: &[u8]) -> StoreResult<i64> {
    let bytes: [u8; 8] = key.try_into().map_err(|_| StoreError::Corrupt {
        reason: format!("round key of length {}", key.len()),
    })?;
    Ok((u64::from_be_bytes(bytes) ^ (1 << 63)) as i64)
}

fn load_tree<T: DeserializeOwned>(tree: &Tree) -> StoreResult<Vec<(sled::IVec, T)>> {
    let mut out = Vec::new();
    for entry in tree.iter() {
        let (key, value) = entry.map_err(|e| StoreError::DatabaseError { source: e })?;
        out.push((key, decode(&value)?));
    }
    Ok(out)
}

impl SledStore {
    /// Open or create a store at `db_path`. `genesis` seeds round 0 of a fresh
    /// database and is ignored when peer sets are already persisted.
    pub fn open<P: AsRef<Path>>(db_path: P, genesis: PeerSet) -> StoreResult<Self> {
        let db = sled::open(db_path).map_err(|e| StoreError::DatabaseError { source: e })?;

        let open = |name: &str| {
            db.open_tree(name)
                .map_err(|e| StoreError::DatabaseError { source: e })
        };

        let mut store = SledStore {
            events: open("events")?,
            evidence: open("evidence")?,
            rounds: open("rounds")?,
            consensus: open("consensus")?,
            blocks: open("blocks")?,
            frames: open("frames")?,
            peer_sets: open("peer_sets")?,
            db,
            cache: InmemStore::new(),
        };

        store.load()?;
        if store.cache.peer_sets().is_empty() {
            store.set_peer_set(0, genesis)?;
        }
        Ok(store)
    }

    /// Whether the database already held events when it was opened.
    pub fn needs_bootstrap(&self) -> bool {
        self.cache.event_count() > 0
    }

    fn load(&mut self) -> StoreResult<()> {
        for (key, peers) in load_tree::<PeerSet>(&self.peer_sets)? {
            self.cache.set_peer_set(round_from_key(&key)?, peers)?;
        }
        for (_, event) in load_tree::<Event>(&self.events)? {
            self.cache.set_event(event)?;
        }
        for (_, event) in load_tree::<Event>(&self.evidence)? {
            self.cache.add_evidence(event)?;
        }
        for (key, info) in load_tree::<RoundInfo>(&self.rounds)? {
            self.cache.set_round(round_from_key(&key)?, info)?;
        }
        for entry in self.consensus.iter() {
            let (_, value) = entry.map_err(|e| StoreError::DatabaseError { source: e })?;
            let hash: [u8; 32] = value.as_ref().try_into().map_err(|_| StoreError::Corrupt {
                reason: "consensus entry is not a hash".to_string(),
            })?;
            self.cache.add_consensus_event(EventHash(hash))?;
        }
        for (_, block) in load_tree::<Block>(&self.blocks)? {
            self.cache.set_block(block)?;
        }
        for (_, frame) in load_tree::<Frame>(&self.frames)? {
            self.cache.set_frame(frame)?;
        }

        if self.cache.event_count() > 0 {
            info!(
                "📂 Loaded {} events, {} blocks from disk",
                self.cache.event_count(),
                self.cache.last_block_index().map(|i| i + 1).unwrap_or(0)
            );
        }
        Ok(())
    }

    fn clear_trees(&self) -> StoreResult<()> {
        for tree in [
            &self.events,
            &self.evidence,
            &self.rounds,
            &self.consensus,
            &self.blocks,
            &self.frames,
            &self.peer_sets,
        ] {
            tree.clear()
                .map_err(|e| StoreError::DatabaseError { source: e })?;
        }
        Ok(())
    }
}

impl Store for SledStore {
    fn get_event(&self, hash: &EventHash) -> StoreResult<Arc<Event>> {
        self.cache.get_event(hash)
    }

    fn has_event(&self, hash: &EventHash) -> bool {
        self.cache.has_event(hash)
    }

    fn set_event(&mut self, event: Event) -> StoreResult<()> {
        self.events
            .insert(event.hash().0, encode(&event)?)
            .map_err(|e| StoreError::DatabaseError { source: e })?;
        self.cache.set_event(event)
    }

    fn participant_event(&self, creator: PeerId, index: i64) -> Option<EventHash> {
        self.cache.participant_event(creator, index)
    }

    fn participant_events(&self, creator: PeerId, after: i64) -> Vec<EventHash> {
        self.cache.participant_events(creator, after)
    }

    fn last_event_from(&self, creator: PeerId) -> Option<(EventHash, i64)> {
        self.cache.last_event_from(creator)
    }

    fn known_events(&self) -> KnownIndexes {
        self.cache.known_events()
    }

    fn event_count(&self) -> usize {
        self.cache.event_count()
    }

    fn all_events(&self) -> Vec<Arc<Event>> {
        self.cache.all_events()
    }

    fn add_evidence(&mut self, event: Event) -> StoreResult<()> {
        self.evidence
            .insert(event.hash().0, encode(&event)?)
            .map_err(|e| StoreError::DatabaseError { source: e })?;
        self.cache.add_evidence(event)
    }

    fn evidence(&self) -> Vec<Event> {
        self.cache.evidence()
    }

    fn has_evidence(&self, hash: &EventHash) -> bool {
        self.cache.has_evidence(hash)
    }

    fn get_evidence(&self, hash: &EventHash) -> Option<Event> {
        self.cache.get_evidence(hash)
    }

    fn faulty_creators(&self) -> BTreeSet<PeerId> {
        self.cache.faulty_creators()
    }

    fn get_round(&self, round: i64) -> Option<RoundInfo> {
        self.cache.get_round(round)
    }

    fn set_round(&mut self, round: i64, info: RoundInfo) -> StoreResult<()> {
        self.rounds
            .insert(round_key(round), encode(&info)?)
            .map_err(|e| StoreError::DatabaseError { source: e })?;
        self.cache.set_round(round, info)
    }

    fn remove_rounds_from(&mut self, round: i64) -> StoreResult<()> {
        for entry in self.rounds.range(round_key(round)..) {
            let (key, _) = entry.map_err(|e| StoreError::DatabaseError { source: e })?;
            self.rounds
                .remove(key)
                .map_err(|e| StoreError::DatabaseError { source: e })?;
        }
        self.cache.remove_rounds_from(round)
    }

    fn last_round(&self) -> i64 {
        self.cache.last_round()
    }

    fn add_consensus_event(&mut self, hash: EventHash) -> StoreResult<()> {
        let position = self.cache.consensus_event_count() as u64;
        self.consensus
            .insert(position.to_be_bytes(), hash.0.to_vec())
            .map_err(|e| StoreError::DatabaseError { source: e })?;
        self.cache.add_consensus_event(hash)
    }

    fn consensus_events(&self) -> Vec<EventHash> {
        self.cache.consensus_events()
    }

    fn consensus_event_count(&self) -> usize {
        self.cache.consensus_event_count()
    }

    fn get_block(&self, index: u64) -> Option<Block> {
        self.cache.get_block(index)
    }

    fn set_block(&mut self, block: Block) -> StoreResult<()> {
        self.blocks
            .insert(block.index().to_be_bytes(), encode(&block)?)
            .map_err(|e| StoreError::DatabaseError { source: e })?;
        debug!("💾 Persisted block {}", block.index());
        self.cache.set_block(block)
    }

    fn last_block_index(&self) -> Option<u64> {
        self.cache.last_block_index()
    }

    fn get_frame(&self, round: i64) -> Option<Frame> {
        self.cache.get_frame(round)
    }

    fn set_frame(&mut self, frame: Frame) -> StoreResult<()> {
        self.frames
            .insert(round_key(frame.round), encode(&frame)?)
            .map_err(|e| StoreError::DatabaseError { source: e })?;
        self.cache.set_frame(frame)
    }

    fn set_peer_set(&mut self, round: i64, peers: PeerSet) -> StoreResult<()> {
        self.peer_sets
            .insert(round_key(round), encode(&peers)?)
            .map_err(|e| StoreError::DatabaseError { source: e })?;
        self.cache.set_peer_set(round, peers)
    }

    fn peer_set_for_round(&self, round: i64) -> Option<PeerSet> {
        self.cache.peer_set_for_round(round)
    }

    fn peer_sets(&self) -> BTreeMap<i64, PeerSet> {
        self.cache.peer_sets()
    }

    fn repertoire_peer(&self, id: PeerId) -> Option<Peer> {
        self.cache.repertoire_peer(id)
    }

    fn reset(&mut self, frame: &Frame) -> StoreResult<()> {
        self.clear_trees()?;
        self.cache.reset(frame)?;
        for (round, peers) in self.cache.peer_sets() {
            self.peer_sets
                .insert(round_key(round), encode(&peers)?)
                .map_err(|e| StoreError::DatabaseError { source: e })?;
        }
        Ok(())
    }

    fn close(&mut self) -> StoreResult<()> {
        self.db
            .flush()
            .map_err(|e| StoreError::DatabaseError { source: e })?;
        Ok(())
    }
}
