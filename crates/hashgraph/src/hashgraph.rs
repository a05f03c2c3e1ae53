//! Virtual-voting consensus over the event DAG.
//!
//! [`Hashgraph`] owns the [`EventStore`] and advances every event through
//! round assignment, witness evaluation, fame decision and ordering. Each call
//! to [`Hashgraph::run_consensus`] picks up where the previous one stopped, so
//! the work done per call is proportional to what arrived in between.
//!
//! Membership changes carried by internal transactions are applied when the
//! round receiving them is processed, and take effect `peer_set_delay` rounds
//! later. Rounds from that point on are recomputed against the new set.

use chrono::{DateTime, Utc};
use hashweave_protocol::{
    Block, BlockSignature, DagStats, Event, EventHash, Frame, InternalTransaction, KnownIndexes,
    PeerId, PeerSet, TransactionKind, WireEvent,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::block_manager::BlockManager;
use crate::errors::HashgraphError;
use crate::event_store::{see, strongly_see, EventStore, InsertOutcome};
use crate::round::{Fame, RoundInfo};
use crate::store::Store;

/// Consensus parameters. Every validator must run with identical values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Every n-th voting round, undecided votes fall back to a coin flip
    pub coin_round_frequency: i64,
    /// Rounds between the round receiving a membership change and the round
    /// where it takes effect
    pub peer_set_delay: i64,
    /// Rounds of received events kept in a frame below its own round
    pub frame_horizon: i64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            coin_round_frequency: 4,
            peer_set_delay: 6,
            frame_horizon: 5,
        }
    }
}

impl ConsensusConfig {
    fn sanitized(mut self) -> Self {
        self.coin_round_frequency = self.coin_round_frequency.max(2);
        self.peer_set_delay = self.peer_set_delay.max(2);
        self.frame_horizon = self.frame_horizon.max(1);
        self
    }
}

/// An event received in the round being processed, with its sort key.
struct Received {
    event: Arc<Event>,
    timestamp: DateTime<Utc>,
    whitened: Vec<u8>,
}

impl Received {
    fn order(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.whitened.cmp(&other.whitened))
            .then_with(|| self.event.hash().cmp(&other.event.hash()))
    }
}

fn xor_into(acc: &mut Vec<u8>, bytes: &[u8]) {
    if acc.len() < bytes.len() {
        acc.resize(bytes.len(), 0);
    }
    for (a, b) in acc.iter_mut().zip(bytes) {
        *a ^= b;
    }
}

/// Pseudorandom vote derived from the voter's signature.
fn coin_flip(voter: &Event) -> bool {
    let digest = blake3::hash(&voter.signature_bytes());
    digest.as_bytes()[16] & 1 == 1
}

/// Deterministic consensus state for one node.
pub struct Hashgraph {
    store: EventStore,
    config: ConsensusConfig,
    /// Inserted events without a round received, in insertion order
    undetermined: Vec<EventHash>,
    /// Rounds with witnesses that are not processed yet
    pending_rounds: BTreeSet<i64>,
    last_consensus_round: Option<i64>,
    block_manager: BlockManager,
    consensus_transactions: u64,
    /// Lowest index per creator where a fork was suspected but not yet seen
    fork_hints: BTreeMap<PeerId, i64>,
}

impl Hashgraph {
    /// Start from an empty store seeded with the genesis peer set.
    pub fn new(backend: Box<dyn Store>, config: ConsensusConfig) -> Self {
        Self {
            store: EventStore::new(backend),
            config: config.sanitized(),
            undetermined: Vec::new(),
            pending_rounds: BTreeSet::new(),
            last_consensus_round: None,
            block_manager: BlockManager::new(),
            consensus_transactions: 0,
            fork_hints: BTreeMap::new(),
        }
    }

    /// Resume from a store that already holds events, e.g. a reopened sled
    /// database.
    pub fn bootstrap(backend: Box<dyn Store>, config: ConsensusConfig) -> Result<Self, HashgraphError> {
        let mut undetermined: Vec<Arc<Event>> = backend
            .all_events()
            .into_iter()
            .filter(|e| e.round_received().is_none())
            .collect();
        undetermined.sort_by(|a, b| {
            a.meta
                .lamport_timestamp
                .cmp(&b.meta.lamport_timestamp)
                .then_with(|| a.hash().cmp(&b.hash()))
        });

        let mut last_consensus_round = None;
        let mut pending_rounds = BTreeSet::new();
        for round in 0..=backend.last_round() {
            if let Some(info) = backend.get_round(round) {
                if info.processed {
                    last_consensus_round = Some(round);
                } else if !info.witnesses.is_empty() {
                    pending_rounds.insert(round);
                }
            }
        }
        if let Some(last) = last_consensus_round {
            pending_rounds.retain(|r| *r > last);
        }

        let mut consensus_transactions = 0;
        for hash in backend.consensus_events() {
            consensus_transactions += backend.get_event(&hash)?.transactions().len() as u64;
        }

        let block_manager = BlockManager::from_store(backend.as_ref());
        info!(
            "🔁 Bootstrapped hashgraph: {} events, {} undetermined, last consensus round {:?}",
            backend.event_count(),
            undetermined.len(),
            last_consensus_round
        );

        let mut hashgraph = Self {
            store: EventStore::new(backend),
            config: config.sanitized(),
            undetermined: undetermined.iter().map(|e| e.hash()).collect(),
            pending_rounds,
            last_consensus_round,
            block_manager,
            consensus_transactions,
            fork_hints: BTreeMap::new(),
        };
        hashgraph.run_consensus()?;
        Ok(hashgraph)
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    // ------------------------------------------------------------------
    // Ingestion

    /// Validate and insert an event, then pick up any block signatures it
    /// carries.
    pub fn insert_event(&mut self, event: Event) -> Result<InsertOutcome, HashgraphError> {
        let outcome = match self.store.insert(event) {
            Ok(outcome) => outcome,
            Err(e) => {
                if let HashgraphError::EquivocationDetected { creator, .. } = &e {
                    self.fork_hints.remove(creator);
                }
                return Err(e);
            }
        };
        if let InsertOutcome::Inserted(hash) = outcome {
            self.undetermined.push(hash);
            let event = self.store.get(&hash)?;
            for sig in event.block_signatures() {
                if sig.validator != event.body.creator {
                    debug!("Ignoring block signature relayed by a non-signer");
                    continue;
                }
                self.block_manager
                    .add_signature(self.store.backend_mut(), sig.clone())?;
            }
        }
        Ok(outcome)
    }

    /// Resolve a wire event's parents against the local DAG and evidence.
    ///
    /// Parents are matched by hash when the wire carries one. A hash that is
    /// unknown while its coordinates hold another event means the creator
    /// forked; the slot is then reported below its real index by
    /// [`Hashgraph::known_events`] so the next sync delivers the other fork.
    pub fn read_wire_info(&mut self, wire: WireEvent) -> Result<Event, HashgraphError> {
        let creator_id = wire.body.creator_id;
        let creator = self
            .store
            .backend()
            .repertoire_peer(creator_id)
            .ok_or_else(|| {
                HashgraphError::invalid(format!("wire event from unknown creator {}", creator_id))
            })?;

        let self_parent = if wire.body.self_parent_index >= 0 {
            Some(self.resolve_parent(
                creator_id,
                wire.body.self_parent_index,
                wire.body.self_parent_hash,
                "self-parent",
            )?)
        } else {
            None
        };

        let other_parent = match wire.body.other_parent_creator_id {
            Some(other) if wire.body.other_parent_index >= 0 => Some(self.resolve_parent(
                other,
                wire.body.other_parent_index,
                wire.body.other_parent_hash,
                "other-parent",
            )?),
            _ => None,
        };

        Ok(Event::from_wire(wire, creator.pub_key_hex, self_parent, other_parent))
    }

    fn resolve_parent(
        &mut self,
        creator: PeerId,
        index: i64,
        hash: Option<EventHash>,
        what: &str,
    ) -> Result<EventHash, HashgraphError> {
        let slot = self.store.backend().participant_event(creator, index);
        match hash {
            Some(hash) if self.store.get_any(&hash).is_some() => Ok(hash),
            Some(hash) => {
                if slot.is_some() {
                    let hint = self.fork_hints.entry(creator).or_insert(index);
                    *hint = (*hint).min(index);
                    debug!("Fork suspected at {}#{}, asking for it again", creator, index);
                }
                Err(HashgraphError::OutOfOrderEvent {
                    reason: format!("{} {}#{} ({:?}) unknown", what, creator, index, hash),
                })
            }
            None => slot.ok_or_else(|| HashgraphError::OutOfOrderEvent {
                reason: format!("{} {}#{} unknown", what, creator, index),
            }),
        }
    }

    /// Project a stored event onto its wire form.
    pub fn to_wire(&self, event: &Event) -> Result<WireEvent, HashgraphError> {
        let other_parent = match event.other_parent() {
            Some(hash) => {
                let parent = self.store.get_any(&hash).ok_or_else(|| {
                    HashgraphError::invalid(format!("other-parent {:?} not stored", hash))
                })?;
                Some((parent.creator_id(), parent.index()))
            }
            None => None,
        };
        Ok(event.to_wire(other_parent))
    }

    /// Events not covered by `known`, parents before children.
    pub fn event_diff(&self, known: &KnownIndexes) -> Result<Vec<Arc<Event>>, HashgraphError> {
        let backend = self.store.backend();
        let mut diff = Vec::new();
        for (creator, last) in backend.known_events() {
            let after = known.get(&creator).copied().unwrap_or(-1);
            if last > after {
                for hash in backend.participant_events(creator, after) {
                    diff.push(self.store.get(&hash)?);
                }
            }
        }
        diff.sort_by(|a, b| {
            a.meta
                .lamport_timestamp
                .cmp(&b.meta.lamport_timestamp)
                .then_with(|| a.hash().cmp(&b.hash()))
        });
        Ok(diff)
    }

    /// Highest index per creator, lowered below any suspected fork.
    pub fn known_events(&self) -> KnownIndexes {
        let mut known = self.store.known_indexes();
        for (creator, index) in &self.fork_hints {
            if let Some(last) = known.get_mut(creator) {
                *last = (*last).min(index - 1);
            }
        }
        known
    }

    pub fn last_event_from(&self, creator: PeerId) -> Option<(EventHash, i64)> {
        self.store.backend().last_event_from(creator)
    }

    pub fn get_event(&self, hash: &EventHash) -> Result<Arc<Event>, HashgraphError> {
        self.store.get(hash)
    }

    // ------------------------------------------------------------------
    // Consensus

    /// Advance rounds, fame and ordering as far as the DAG allows. Returns
    /// the blocks produced, in index order.
    pub fn run_consensus(&mut self) -> Result<Vec<Block>, HashgraphError> {
        let mut blocks = Vec::new();
        loop {
            self.divide_rounds()?;
            self.decide_fame()?;
            let (mut produced, membership_changed) = self.process_decided_rounds()?;
            blocks.append(&mut produced);
            if !membership_changed {
                break;
            }
        }
        Ok(blocks)
    }

    fn peer_set(&self, round: i64) -> PeerSet {
        self.store
            .backend()
            .peer_set_for_round(round)
            .unwrap_or_default()
    }

    fn load_round(&self, round: i64) -> RoundInfo {
        self.store.backend().get_round(round).unwrap_or_default()
    }

    fn is_settled(&self, round: i64) -> bool {
        self.last_consensus_round.map_or(false, |last| round <= last)
    }

    /// Assign a round and witness flag to every undetermined event lacking one.
    fn divide_rounds(&mut self) -> Result<(), HashgraphError> {
        for hash in self.undetermined.clone() {
            let event = self.store.get(&hash)?;
            if event.round().is_some() {
                continue;
            }

            let round = self.compute_round(&event)?;
            let witness = self.compute_witness(&event, round)?;

            let mut updated = (*event).clone();
            updated.meta.round = Some(round);
            updated.meta.witness = witness;
            self.store.update(updated)?;

            if witness {
                let mut info = self.load_round(round);
                let settled = self.is_settled(round) || info.decided;
                let fame = if settled { Fame::NotFamous } else { Fame::Undecided };
                info.add_witness(hash, fame);
                self.store.backend_mut().set_round(round, info)?;
                if !settled {
                    self.pending_rounds.insert(round);
                }
            }
        }
        Ok(())
    }

    fn compute_round(&self, event: &Event) -> Result<i64, HashgraphError> {
        let mut parent_round = None;
        for parent in [event.self_parent(), event.other_parent()].into_iter().flatten() {
            // evidence parents never carry a round
            if !self.store.contains(&parent) {
                continue;
            }
            let round = self.store.get(&parent)?.round().unwrap_or(0);
            parent_round = Some(parent_round.map_or(round, |r: i64| r.max(round)));
        }
        let Some(parent_round) = parent_round else {
            return Ok(0);
        };
        // a creator's first event is a witness of the round it attaches to
        if event.self_parent().is_none() {
            return Ok(parent_round);
        }

        let peers = self.peer_set(parent_round);
        let mut stake = 0;
        for witness in self.load_round(parent_round).witnesses() {
            let witness = self.store.get(&witness)?;
            if strongly_see(event, &witness, &peers) {
                stake += peers.stake_of(witness.creator_id());
            }
        }
        if stake >= peers.super_majority() {
            Ok(parent_round + 1)
        } else {
            Ok(parent_round)
        }
    }

    fn compute_witness(&self, event: &Event, round: i64) -> Result<bool, HashgraphError> {
        if !self.peer_set(round).contains(event.creator_id()) {
            return Ok(false);
        }
        match event.self_parent() {
            None => Ok(true),
            Some(sp) => {
                let parent_round = self.store.get(&sp)?.round().unwrap_or(-1);
                Ok(round > parent_round)
            }
        }
    }

    /// Virtual voting over the pending rounds.
    fn decide_fame(&mut self) -> Result<(), HashgraphError> {
        let last_round = self.store.backend().last_round();
        let mut votes: HashMap<(EventHash, EventHash), bool> = HashMap::new();

        for round in self.pending_rounds.clone() {
            let mut info = self.load_round(round);
            if info.decided {
                continue;
            }

            for target in info.undecided_witnesses() {
                let target_event = self.store.get(&target)?;

                'voting: for voting_round in (round + 1)..=last_round {
                    let diff = voting_round - round;
                    let voters = self.load_round(voting_round).witnesses();
                    let prev_witnesses = self.load_round(voting_round - 1).witnesses();
                    let prev_peers = self.peer_set(voting_round - 1);

                    for voter in voters {
                        let voter_event = self.store.get(&voter)?;
                        if diff == 1 {
                            votes.insert((voter, target), see(&voter_event, &target_event));
                            continue;
                        }

                        let (mut yays, mut nays) = (0u64, 0u64);
                        for witness in &prev_witnesses {
                            let witness_event = self.store.get(witness)?;
                            if !strongly_see(&voter_event, &witness_event, &prev_peers) {
                                continue;
                            }
                            let stake = prev_peers.stake_of(witness_event.creator_id());
                            match votes.get(&(*witness, target)) {
                                Some(true) => yays += stake,
                                Some(false) => nays += stake,
                                None => {}
                            }
                        }
                        let vote = yays >= nays;
                        let tally = yays.max(nays);
                        let supermajority = tally >= prev_peers.super_majority();

                        if diff % self.config.coin_round_frequency != 0 {
                            if supermajority {
                                info.set_fame(target, vote);
                                debug!(
                                    "Witness {:?} of round {} decided {} at round {}",
                                    target,
                                    round,
                                    if vote { "famous" } else { "not famous" },
                                    voting_round
                                );
                                break 'voting;
                            }
                            votes.insert((voter, target), vote);
                        } else if supermajority {
                            votes.insert((voter, target), vote);
                        } else {
                            votes.insert((voter, target), coin_flip(&voter_event));
                        }
                    }
                }
            }

            if info.witnesses_decided() {
                info.decided = true;
                debug!("Round {} decided", round);
            }
            self.store.backend_mut().set_round(round, info)?;
        }
        Ok(())
    }

    /// Order the events received by every decided round, lowest first.
    ///
    /// Returns the blocks produced and whether a membership change requires
    /// the upper rounds to be recomputed.
    fn process_decided_rounds(&mut self) -> Result<(Vec<Block>, bool), HashgraphError> {
        let mut blocks = Vec::new();

        while let Some(round) = self.pending_rounds.iter().next().copied() {
            let mut info = self.load_round(round);
            if !info.decided {
                break;
            }

            let mut famous = Vec::new();
            for hash in info.famous_witnesses() {
                famous.push(self.store.get(&hash)?);
            }

            let mut received = Vec::new();
            if !famous.is_empty() {
                let mut whitener = Vec::new();
                for witness in &famous {
                    xor_into(&mut whitener, &witness.signature_bytes());
                }
                for hash in &self.undetermined {
                    let event = self.store.get(hash)?;
                    if event.round().map_or(true, |r| r > round) {
                        continue;
                    }
                    if famous.iter().all(|w| see(w, &event)) {
                        let timestamp = self.median_timestamp(&event, &famous)?;
                        let mut whitened = whitener.clone();
                        xor_into(&mut whitened, &event.signature_bytes());
                        received.push(Received {
                            event,
                            timestamp,
                            whitened,
                        });
                    }
                }
            }
            received.sort_by(|a, b| a.order(b));

            let mut received_events = Vec::with_capacity(received.len());
            let mut received_set = HashSet::with_capacity(received.len());
            let mut internal_transactions: Vec<InternalTransaction> = Vec::new();
            for item in received {
                let hash = item.event.hash();
                let mut updated = (*item.event).clone();
                updated.meta.round_received = Some(round);
                updated.meta.consensus_timestamp = Some(item.timestamp);
                self.consensus_transactions += updated.transactions().len() as u64;
                internal_transactions.extend(updated.internal_transactions().iter().cloned());
                self.store.update(updated)?;
                self.store.backend_mut().add_consensus_event(hash)?;
                info.received_events.push(hash);
                received_set.insert(hash);
                received_events.push(self.store.get(&hash)?);
            }
            self.undetermined.retain(|h| !received_set.contains(h));

            info.processed = true;
            self.store.backend_mut().set_round(round, info)?;
            self.pending_rounds.remove(&round);
            self.last_consensus_round = Some(round);
            debug!("Round {} processed, {} events received", round, received_events.len());

            let effective = self.apply_internal_transactions(round, &internal_transactions)?;

            if received_events.iter().any(|e| e.is_loaded()) {
                let frame = self.make_frame(round)?;
                if let Some(block) = self.block_manager.create_block(
                    self.store.backend_mut(),
                    &frame,
                    &received_events,
                )? {
                    blocks.push(block);
                }
            }

            if let Some(effective) = effective {
                self.reset_rounds_from(effective - 1)?;
                return Ok((blocks, true));
            }
        }
        Ok((blocks, false))
    }

    /// Median of the times each famous witness's creator first learned of
    /// `event`.
    fn median_timestamp(
        &self,
        event: &Event,
        famous: &[Arc<Event>],
    ) -> Result<DateTime<Utc>, HashgraphError> {
        let backend = self.store.backend();
        let mut stamps = Vec::with_capacity(famous.len());
        for witness in famous {
            let creator = witness.creator_id();
            let first = event
                .meta
                .first_descendants
                .get(&creator)
                .and_then(|index| backend.participant_event(creator, *index));
            let stamp = match first {
                Some(hash) => self.store.get(&hash)?.body.timestamp,
                None => witness.body.timestamp,
            };
            stamps.push(stamp);
        }
        stamps.sort();
        Ok(stamps[stamps.len() / 2])
    }

    /// Apply accepted membership changes on top of the latest peer set.
    /// Returns the round at which the new set takes effect, if any.
    fn apply_internal_transactions(
        &mut self,
        round: i64,
        transactions: &[InternalTransaction],
    ) -> Result<Option<i64>, HashgraphError> {
        if transactions.is_empty() {
            return Ok(None);
        }

        let mut current = self
            .store
            .backend()
            .peer_sets()
            .into_values()
            .next_back()
            .unwrap_or_default();
        let mut changed = false;

        for itx in transactions {
            if !itx.verify().unwrap_or(false) {
                warn!("⚠️ Dropping internal transaction with a bad signature");
                continue;
            }
            let next = match itx.body.kind {
                TransactionKind::PeerAdd => current.with_new_peer(itx.body.peer.clone()),
                TransactionKind::PeerRemove => itx
                    .body
                    .peer
                    .id()
                    .and_then(|id| current.with_removed_peer(id)),
            };
            match next {
                Ok(next) => {
                    info!(
                        "👥 {:?} {} accepted in round {}",
                        itx.body.kind, itx.body.peer.moniker, round
                    );
                    current = next;
                    changed = true;
                }
                Err(e) => warn!("⚠️ Membership change rejected: {}", e),
            }
        }

        if !changed {
            return Ok(None);
        }
        let effective = round + self.config.peer_set_delay;
        self.store.backend_mut().set_peer_set(effective, current)?;
        info!("👥 New peer set takes effect at round {}", effective);
        Ok(Some(effective))
    }

    /// Forget round assignments from `from` upwards so they are recomputed
    /// against the current peer-set history.
    fn reset_rounds_from(&mut self, from: i64) -> Result<(), HashgraphError> {
        let from = match self.last_consensus_round {
            Some(last) => from.max(last + 1),
            None => from,
        };
        self.store.backend_mut().remove_rounds_from(from)?;
        self.pending_rounds.retain(|r| *r < from);
        for hash in self.undetermined.clone() {
            let event = self.store.get(&hash)?;
            if event.round().map_or(false, |r| r >= from) {
                let mut updated = (*event).clone();
                updated.meta.round = None;
                updated.meta.witness = false;
                self.store.update(updated)?;
            }
        }
        Ok(())
    }

    /// Snapshot of the consensus state after `round` was processed.
    fn make_frame(&self, round: i64) -> Result<Frame, HashgraphError> {
        let backend = self.store.backend();
        let horizon = round - self.config.frame_horizon;
        let mut selected: BTreeMap<EventHash, Arc<Event>> = BTreeMap::new();

        for received_round in horizon.max(0)..=round {
            let Some(info) = backend.get_round(received_round) else {
                continue;
            };
            for hash in &info.received_events {
                let event = self.store.get(hash)?;
                if received_round == round || event.round().map_or(false, |r| r >= horizon) {
                    selected.insert(*hash, event);
                }
            }
        }

        // the newest consensus event of every creator roots its chain
        for creator in backend.known_events().keys() {
            let Some((mut hash, mut index)) = backend.last_event_from(*creator) else {
                continue;
            };
            loop {
                let event = self.store.get(&hash)?;
                if event.round_received().map_or(false, |rr| rr <= round) {
                    selected.insert(hash, event);
                    break;
                }
                index -= 1;
                match backend.participant_event(*creator, index) {
                    Some(prev) => hash = prev,
                    None => break,
                }
            }
        }

        let mut events = Vec::with_capacity(selected.len());
        for event in selected.values() {
            let mut event = (**event).clone();
            let mut first_descendants = BTreeMap::new();
            for (creator, index) in &event.meta.first_descendants {
                let Some(hash) = backend.participant_event(*creator, *index) else {
                    continue;
                };
                if self
                    .store
                    .get(&hash)?
                    .round_received()
                    .map_or(false, |rr| rr <= round)
                {
                    first_descendants.insert(*creator, *index);
                }
            }
            event.meta.first_descendants = first_descendants;
            events.push(event);
        }
        events.sort_by(|a, b| {
            a.meta
                .lamport_timestamp
                .cmp(&b.meta.lamport_timestamp)
                .then_with(|| a.hash().cmp(&b.hash()))
        });

        Ok(Frame {
            round,
            peers: self.peer_set(round),
            peer_sets: backend.peer_sets(),
            events,
        })
    }

    // ------------------------------------------------------------------
    // Blocks

    pub fn get_block(&self, index: u64) -> Option<Block> {
        self.store.backend().get_block(index)
    }

    pub fn get_frame(&self, round: i64) -> Option<Frame> {
        self.store.backend().get_frame(round)
    }

    pub fn last_block_index(&self) -> Option<u64> {
        self.block_manager.last_block_index()
    }

    /// Record the application's state hash for a committed block.
    pub fn set_block_state_hash(
        &mut self,
        index: u64,
        state_hash: Vec<u8>,
    ) -> Result<Block, HashgraphError> {
        self.block_manager
            .set_state_hash(self.store.backend_mut(), index, state_hash)
    }

    pub fn add_block_signature(&mut self, sig: BlockSignature) -> Result<bool, HashgraphError> {
        self.block_manager.add_signature(self.store.backend_mut(), sig)
    }

    /// Newest block signed by a trust count of its validators, with the frame
    /// it was produced from.
    pub fn anchor(&self) -> Option<(Block, Frame)> {
        let index = self.block_manager.anchor_block()?;
        let block = self.get_block(index)?;
        let frame = self.get_frame(block.round_received())?;
        Some((block, frame))
    }

    // ------------------------------------------------------------------
    // Fast-forward

    /// Replace the whole consensus state with the content of a validated
    /// frame and its block.
    pub fn reset(&mut self, block: Block, frame: Frame) -> Result<(), HashgraphError> {
        if block.round_received() != frame.round {
            return Err(HashgraphError::SnapshotMismatch {
                reason: format!(
                    "block round {} does not match frame round {}",
                    block.round_received(),
                    frame.round
                ),
            });
        }

        let in_force = frame.peer_sets.range(..=frame.round).next_back().map(|(_, peers)| peers);
        if in_force != Some(&frame.peers) {
            return Err(HashgraphError::SnapshotMismatch {
                reason: format!("frame peers are not the set in force at round {}", frame.round),
            });
        }

        self.store.backend_mut().reset(&frame)?;

        let mut rounds: BTreeMap<i64, RoundInfo> = BTreeMap::new();
        let mut ordered: Vec<&Event> = Vec::new();
        for event in &frame.events {
            let hash = self.store.insert_trusted(event.clone())?;
            if let (true, Some(round)) = (event.is_witness(), event.round()) {
                rounds.entry(round).or_default().add_witness(hash, Fame::NotFamous);
            }
            if event.round_received().is_some() {
                ordered.push(event);
            }
        }
        ordered.sort_by(|a, b| {
            a.round_received()
                .cmp(&b.round_received())
                .then_with(|| a.meta.consensus_timestamp.cmp(&b.meta.consensus_timestamp))
                .then_with(|| a.hash().cmp(&b.hash()))
        });

        self.consensus_transactions = 0;
        for event in ordered {
            let hash = event.hash();
            if let Some(rr) = event.round_received() {
                rounds.entry(rr).or_default().received_events.push(hash);
            }
            self.consensus_transactions += event.transactions().len() as u64;
            self.store.backend_mut().add_consensus_event(hash)?;
        }

        for (round, mut info) in rounds {
            if round <= frame.round {
                info.decided = true;
                info.processed = true;
            }
            self.store.backend_mut().set_round(round, info)?;
        }

        self.store.backend_mut().set_frame(frame.clone())?;
        self.store.backend_mut().set_block(block.clone())?;
        self.block_manager.reset(&block);

        self.undetermined.clear();
        self.pending_rounds.clear();
        self.fork_hints.clear();
        self.last_consensus_round = Some(frame.round);

        info!(
            "⏩ Reset to block {} at round {} ({} frame events)",
            block.index(),
            frame.round,
            frame.events.len()
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Introspection

    pub fn last_consensus_round(&self) -> Option<i64> {
        self.last_consensus_round
    }

    pub fn last_round(&self) -> i64 {
        self.store.backend().last_round()
    }

    /// Newest accepted peer set, including changes that take effect in a
    /// future round.
    pub fn current_peers(&self) -> PeerSet {
        self.store
            .backend()
            .peer_sets()
            .into_values()
            .last()
            .unwrap_or_default()
    }

    /// Whether an accepted peer set change has not reached its effective
    /// round yet.
    pub fn has_pending_peer_set(&self) -> bool {
        self.store
            .backend()
            .peer_sets()
            .keys()
            .next_back()
            .map_or(false, |round| *round > self.last_round().max(0))
    }

    pub fn peer_sets(&self) -> BTreeMap<i64, PeerSet> {
        self.store.backend().peer_sets()
    }

    /// Peer set in force at round 0.
    pub fn genesis_peers(&self) -> PeerSet {
        self.peer_set(0)
    }

    pub fn peer_set_at(&self, round: i64) -> PeerSet {
        self.peer_set(round)
    }

    pub fn undetermined_count(&self) -> usize {
        self.undetermined.len()
    }

    /// Undetermined events that carry transactions or membership changes.
    pub fn pending_loaded_events(&self) -> usize {
        self.undetermined
            .iter()
            .filter(|h| self.store.get(h).map(|e| e.is_loaded()).unwrap_or(false))
            .count()
    }

    pub fn round_of(&self, hash: &EventHash) -> Result<Option<i64>, HashgraphError> {
        Ok(self.store.get(hash)?.round())
    }

    pub fn round_info(&self, round: i64) -> Option<RoundInfo> {
        self.store.backend().get_round(round)
    }

    /// Event hashes in consensus order.
    pub fn consensus_events(&self) -> Vec<EventHash> {
        self.store.backend().consensus_events()
    }

    pub fn is_faulty(&self, creator: PeerId) -> bool {
        self.store.faulty_creators().contains(&creator)
    }

    pub fn stats(&self) -> DagStats {
        let backend = self.store.backend();
        DagStats {
            total_events: backend.event_count(),
            undetermined_events: self.undetermined.len(),
            consensus_events: backend.consensus_event_count(),
            consensus_transactions: self.consensus_transactions,
            last_consensus_round: self.last_consensus_round,
            last_round: backend.last_round(),
            creator_count: backend.known_events().values().filter(|i| **i >= 0).count(),
            faulty_creators: backend.faulty_creators().len(),
        }
    }

    pub fn close(&mut self) -> Result<(), HashgraphError> {
        self.store.backend_mut().close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sled_store::SledStore;
    use crate::store::InmemStore;
    use chrono::TimeZone;
    use hashweave_protocol::{KeyPair, Peer, Signer};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::TempDir;

    /// Scripted gossip between a fixed set of validators.
    struct TestNet {
        keys: Vec<KeyPair>,
        peers: PeerSet,
        events: Vec<Event>,
        heads: Vec<Option<EventHash>>,
        next_index: Vec<i64>,
    }

    impl TestNet {
        fn new(n: usize) -> Self {
            let keys: Vec<KeyPair> = (0..n).map(|_| KeyPair::generate()).collect();
            let peers = PeerSet::new(
                keys.iter()
                    .enumerate()
                    .map(|(i, k)| Peer::new(k.public_key_hex(), format!("addr{}", i), format!("node{}", i)))
                    .collect(),
            )
            .unwrap();
            Self {
                keys,
                peers,
                events: Vec::new(),
                heads: vec![None; n],
                next_index: vec![0; n],
            }
        }

        fn create(&mut self, creator: usize, other: Option<usize>, itxs: Vec<InternalTransaction>) -> EventHash {
            let step = self.events.len() as i64;
            let timestamp = Utc.timestamp_opt(1_700_000_000 + step, 0).unwrap();
            let mut event = Event::new(
                vec![format!("tx-{}-{}", creator, step).into_bytes()],
                itxs,
                vec![],
                self.heads[creator],
                other.and_then(|o| self.heads[o]),
                self.keys[creator].public_key_hex(),
                self.next_index[creator],
                timestamp,
            );
            event.sign(&self.keys[creator]).unwrap();
            let hash = event.hash();
            self.heads[creator] = Some(hash);
            self.next_index[creator] += 1;
            self.events.push(event);
            hash
        }

        /// Every validator starts with a parentless event, then random pairs sync.
        fn gossip(&mut self, steps: usize, seed: u64) {
            let n = self.keys.len();
            for i in 0..n {
                if self.heads[i].is_none() {
                    self.create(i, None, vec![]);
                }
            }
            let mut rng = StdRng::seed_from_u64(seed);
            for _ in 0..steps {
                let creator = rng.gen_range(0..n);
                let mut other = rng.gen_range(0..n - 1);
                if other >= creator {
                    other += 1;
                }
                self.create(creator, Some(other), vec![]);
            }
        }

        fn hashgraph(&self) -> Hashgraph {
            let mut hashgraph = Hashgraph::new(
                Box::new(InmemStore::with_genesis(self.peers.clone())),
                ConsensusConfig::default(),
            );
            for event in &self.events {
                hashgraph.insert_event(event.clone()).unwrap();
            }
            hashgraph.run_consensus().unwrap();
            hashgraph
        }
    }

    fn all_blocks(hashgraph: &Hashgraph) -> Vec<Block> {
        match hashgraph.last_block_index() {
            Some(last) => (0..=last).filter_map(|i| hashgraph.get_block(i)).collect(),
            None => Vec::new(),
        }
    }

    #[test]
    fn test_three_validators_reach_consensus() {
        let mut net = TestNet::new(3);
        let a1 = net.create(0, None, vec![]);
        let b1 = net.create(1, Some(0), vec![]);
        let c1 = net.create(2, Some(1), vec![]);
        net.gossip(120, 7);

        let hashgraph = net.hashgraph();

        for hash in [a1, b1, c1] {
            let event = hashgraph.get_event(&hash).unwrap();
            assert_eq!(event.round(), Some(0));
            assert!(event.is_witness());
            assert!(event.round_received().is_some());
        }

        // every famous witness of round 0 descends from a1
        let a1 = hashgraph.get_event(&a1).unwrap();
        assert_eq!(a1.round_received(), Some(0));
        assert_eq!(hashgraph.consensus_events().first(), Some(&a1.hash()));

        let round0 = hashgraph.round_info(0).unwrap();
        assert!(round0.decided);
        assert!(round0.processed);
        let round1 = hashgraph.round_info(1).unwrap();
        assert!(round1.decided);
        assert!(!round1.famous_witnesses().is_empty());

        assert!(hashgraph.last_consensus_round().unwrap() >= 1);
        assert!(hashgraph.last_block_index().is_some());

        // block contents follow the consensus order
        let ordered: Vec<Vec<u8>> = hashgraph
            .consensus_events()
            .iter()
            .flat_map(|h| hashgraph.get_event(h).unwrap().transactions().to_vec())
            .collect();
        let in_blocks: Vec<Vec<u8>> = all_blocks(&hashgraph)
            .iter()
            .flat_map(|b| b.transactions().to_vec())
            .collect();
        assert_eq!(ordered, in_blocks);
    }

    #[test]
    fn test_consensus_timestamps_are_monotonic_per_round() {
        let mut net = TestNet::new(4);
        net.gossip(200, 11);
        let hashgraph = net.hashgraph();

        let mut last_round = -1;
        for hash in hashgraph.consensus_events() {
            let event = hashgraph.get_event(&hash).unwrap();
            let rr = event.round_received().unwrap();
            assert!(rr >= last_round);
            assert!(rr >= event.round().unwrap());
            assert!(event.meta.consensus_timestamp.is_some());
            last_round = rr;
        }
    }

    #[test]
    fn test_order_independent_of_arrival() {
        let mut net = TestNet::new(4);
        net.gossip(240, 3);

        let batch = net.hashgraph();

        // insert in another topological order, running consensus as we go
        let mut incremental = Hashgraph::new(
            Box::new(InmemStore::with_genesis(net.peers.clone())),
            ConsensusConfig::default(),
        );
        let mut remaining: Vec<Event> = net.events.clone();
        let mut rng = StdRng::seed_from_u64(99);
        while !remaining.is_empty() {
            let ready: Vec<usize> = remaining
                .iter()
                .enumerate()
                .filter(|(_, e)| {
                    [e.self_parent(), e.other_parent()]
                        .into_iter()
                        .flatten()
                        .all(|p| incremental.store().contains(&p))
                })
                .map(|(i, _)| i)
                .collect();
            let pick = ready[rng.gen_range(0..ready.len())];
            let event = remaining.remove(pick);
            incremental.insert_event(event).unwrap();
            incremental.run_consensus().unwrap();
        }

        assert!(!batch.consensus_events().is_empty());
        assert_eq!(batch.consensus_events(), incremental.consensus_events());
        assert_eq!(all_blocks(&batch), all_blocks(&incremental));
        assert_eq!(batch.last_consensus_round(), incremental.last_consensus_round());
    }

    #[test]
    fn test_rerunning_consensus_changes_nothing() {
        let mut net = TestNet::new(3);
        net.gossip(90, 5);
        let mut hashgraph = net.hashgraph();
        let before = hashgraph.consensus_events();
        let blocks = hashgraph.run_consensus().unwrap();
        assert!(blocks.is_empty());
        assert_eq!(before, hashgraph.consensus_events());
    }

    #[test]
    fn test_membership_change_takes_effect_after_delay() {
        let mut net = TestNet::new(3);
        net.gossip(0, 1);

        let joiner = KeyPair::generate();
        let mut itx = InternalTransaction::new(
            TransactionKind::PeerAdd,
            Peer::new(joiner.public_key_hex(), "addr3", "node3"),
        );
        itx.sign(&joiner).unwrap();
        let carrier = net.create(0, Some(1), vec![itx]);

        // before consensus the change is invisible
        let mut early = Hashgraph::new(
            Box::new(InmemStore::with_genesis(net.peers.clone())),
            ConsensusConfig::default(),
        );
        for event in &net.events {
            early.insert_event(event.clone()).unwrap();
        }
        early.run_consensus().unwrap();
        assert!(!early.current_peers().contains(joiner.peer_id()));

        net.gossip(200, 17);
        let hashgraph = net.hashgraph();

        let rr = hashgraph
            .get_event(&carrier)
            .unwrap()
            .round_received()
            .expect("carrier received");
        let delay = hashgraph.config().peer_set_delay;
        assert!(!hashgraph.peer_set_at(rr + delay - 1).contains(joiner.peer_id()));
        assert!(hashgraph.peer_set_at(rr + delay).contains(joiner.peer_id()));
        assert!(!hashgraph.genesis_peers().contains(joiner.peer_id()));
        assert_eq!(hashgraph.peer_set_at(rr + delay).len(), 4);

        // the block of that round carries the proposal
        let block = all_blocks(&hashgraph)
            .into_iter()
            .find(|b| b.round_received() == rr)
            .unwrap();
        assert_eq!(block.internal_transactions().len(), 1);
    }

    #[test]
    fn test_reset_from_frame_matches_full_replay() {
        let mut net = TestNet::new(4);
        net.gossip(260, 23);
        let full = net.hashgraph();

        let blocks = all_blocks(&full);
        assert!(blocks.len() > 4);
        let anchor = blocks[blocks.len() / 2].clone();
        let frame = full.get_frame(anchor.round_received()).unwrap();
        assert_eq!(frame.hash().unwrap(), anchor.body.frame_hash);

        let mut fresh = Hashgraph::new(
            Box::new(InmemStore::with_genesis(net.peers.clone())),
            ConsensusConfig::default(),
        );
        fresh.reset(anchor.clone(), frame).unwrap();
        assert_eq!(fresh.last_block_index(), Some(anchor.index()));
        assert_eq!(fresh.last_consensus_round(), Some(anchor.round_received()));

        for event in full.event_diff(&fresh.known_events()).unwrap() {
            let wire = full.to_wire(&event).unwrap();
            let event = fresh.read_wire_info(wire).unwrap();
            fresh.insert_event(event).unwrap();
        }
        fresh.run_consensus().unwrap();

        assert_eq!(fresh.last_block_index(), full.last_block_index());
        for index in anchor.index() + 1..=full.last_block_index().unwrap() {
            assert_eq!(fresh.get_block(index), full.get_block(index));
        }
    }

    #[test]
    fn test_reset_rejects_mismatched_frame() {
        let mut net = TestNet::new(3);
        net.gossip(120, 29);
        let full = net.hashgraph();
        let blocks = all_blocks(&full);
        let block = blocks[0].clone();
        let other = full.get_frame(blocks[1].round_received()).unwrap();

        let mut fresh = Hashgraph::new(
            Box::new(InmemStore::with_genesis(net.peers.clone())),
            ConsensusConfig::default(),
        );
        assert!(matches!(
            fresh.reset(block, other),
            Err(HashgraphError::SnapshotMismatch { .. })
        ));
    }

    #[test]
    fn test_anchor_needs_trust_count_signatures() {
        let mut net = TestNet::new(4);
        net.gossip(160, 31);
        let mut hashgraph = net.hashgraph();
        assert!(hashgraph.anchor().is_none());

        let block = hashgraph.set_block_state_hash(0, vec![0xAB; 32]).unwrap();
        // trust count of four equal validators is two
        let sig = block.sign(&net.keys[0]).unwrap();
        assert!(hashgraph.add_block_signature(sig.clone()).unwrap());
        assert!(!hashgraph.add_block_signature(sig).unwrap());
        assert!(hashgraph.anchor().is_none());

        let outsider = KeyPair::generate();
        assert!(!hashgraph
            .add_block_signature(block.sign(&outsider).unwrap())
            .unwrap());

        hashgraph
            .add_block_signature(block.sign(&net.keys[1]).unwrap())
            .unwrap();
        let (anchor, frame) = hashgraph.anchor().unwrap();
        assert_eq!(anchor.index(), 0);
        assert_eq!(frame.round, anchor.round_received());
    }

    #[test]
    fn test_signatures_before_commit_are_held() {
        let mut net = TestNet::new(3);
        net.gossip(120, 37);
        let mut hashgraph = net.hashgraph();

        let mut committed = hashgraph.get_block(0).unwrap();
        committed.body.state_hash = vec![7; 32];
        let early = committed.sign(&net.keys[2]).unwrap();
        assert!(!hashgraph.add_block_signature(early).unwrap());

        let block = hashgraph.set_block_state_hash(0, vec![7; 32]).unwrap();
        assert_eq!(block.signatures.len(), 1);
        assert!(hashgraph.anchor().is_some());
    }

    #[test]
    fn test_bootstrap_from_sled() {
        let temp_dir = TempDir::new().unwrap();
        let mut net = TestNet::new(3);
        net.gossip(100, 41);

        let (consensus, last_block) = {
            let store = SledStore::open(temp_dir.path(), net.peers.clone()).unwrap();
            let mut hashgraph = Hashgraph::new(Box::new(store), ConsensusConfig::default());
            for event in &net.events {
                hashgraph.insert_event(event.clone()).unwrap();
            }
            hashgraph.run_consensus().unwrap();
            hashgraph.close().unwrap();
            (hashgraph.consensus_events(), hashgraph.last_block_index())
        };

        let store = SledStore::open(temp_dir.path(), PeerSet::default()).unwrap();
        assert!(store.needs_bootstrap());
        let hashgraph = Hashgraph::bootstrap(Box::new(store), ConsensusConfig::default()).unwrap();
        assert_eq!(hashgraph.consensus_events(), consensus);
        assert_eq!(hashgraph.last_block_index(), last_block);
        assert_eq!(hashgraph.known_events(), net.hashgraph().known_events());
    }

    #[test]
    fn test_event_diff_is_topological() {
        let mut net = TestNet::new(3);
        net.gossip(60, 43);
        let hashgraph = net.hashgraph();

        let mut known = hashgraph.known_events();
        for index in known.values_mut() {
            *index = (*index - 5).max(-1);
        }
        let diff = hashgraph.event_diff(&known).unwrap();
        assert!(!diff.is_empty());
        let mut seen = HashSet::new();
        for event in &diff {
            for parent in [event.self_parent(), event.other_parent()].into_iter().flatten() {
                let parent_event = hashgraph.get_event(&parent).unwrap();
                let parent_known = known[&parent_event.creator_id()] >= parent_event.index();
                assert!(parent_known || seen.contains(&parent));
            }
            seen.insert(event.hash());
        }
    }

    #[test]
    fn test_late_first_event_is_witness_of_its_parent_round() {
        let mut net = TestNet::new(4);
        for creator in 0..3 {
            net.create(creator, None, vec![]);
        }
        for step in 0..30 {
            net.create(step % 3, Some((step + 1) % 3), vec![]);
        }
        let late = net.create(3, Some(0), vec![]);

        let hashgraph = net.hashgraph();
        let late = hashgraph.get_event(&late).unwrap();
        let parent = hashgraph.get_event(&late.other_parent().unwrap()).unwrap();
        assert!(parent.round().unwrap() > 0);
        assert_eq!(late.round(), parent.round());
        assert!(late.is_witness());
    }

    fn signed_event(
        key: &KeyPair,
        index: i64,
        self_parent: Option<EventHash>,
        other_parent: Option<EventHash>,
        tag: &str,
    ) -> Event {
        let timestamp = Utc.timestamp_opt(1_700_100_000 + index, 0).unwrap();
        let mut event = Event::new(
            vec![tag.as_bytes().to_vec()],
            vec![],
            vec![],
            self_parent,
            other_parent,
            key.public_key_hex(),
            index,
            timestamp,
        );
        event.sign(key).unwrap();
        event
    }

    #[test]
    fn test_honest_events_on_the_other_fork_are_admitted() {
        let mut net = TestNet::new(4);
        let roots: Vec<EventHash> = (0..4).map(|i| net.create(i, None, vec![])).collect();
        let forker = net.keys[3].peer_id();

        let fork_a = signed_event(&net.keys[3], 1, Some(roots[3]), Some(roots[0]), "fork-a");
        let fork_b = signed_event(&net.keys[3], 1, Some(roots[3]), Some(roots[1]), "fork-b");
        let b1 = signed_event(&net.keys[1], 1, Some(roots[1]), Some(fork_b.hash()), "b1");
        let b2 = signed_event(&net.keys[1], 2, Some(b1.hash()), Some(roots[2]), "b2");

        // x holds fork a, y holds fork b and builds on it
        let mut x = net.hashgraph();
        x.insert_event(fork_a.clone()).unwrap();
        let mut y = net.hashgraph();
        for event in [&fork_b, &b1, &b2] {
            y.insert_event(event.clone()).unwrap();
        }

        let wire = y.to_wire(&b1).unwrap();
        assert!(matches!(
            x.read_wire_info(wire),
            Err(HashgraphError::OutOfOrderEvent { .. })
        ));
        assert_eq!(x.known_events()[&forker], 0);

        let diff = y.event_diff(&x.known_events()).unwrap();
        assert_eq!(diff.len(), 3);
        for event in diff {
            let event = x.read_wire_info(y.to_wire(&event).unwrap()).unwrap();
            let hash = event.hash();
            match x.insert_event(event) {
                Err(HashgraphError::EquivocationDetected { creator, index }) => {
                    assert_eq!(hash, fork_b.hash());
                    assert_eq!((creator, index), (forker, 1));
                }
                outcome => assert_eq!(outcome.unwrap(), InsertOutcome::Inserted(hash)),
            }
        }

        assert!(x.store().evidence().iter().any(|e| e.hash() == fork_b.hash()));
        assert_eq!(x.known_events()[&forker], 1);
        assert!(x.get_event(&b2.hash()).is_ok());
        assert!(x.get_event(&fork_b.hash()).is_err());

        // the forked chain keeps growing as evidence only
        let fork_b2 = signed_event(&net.keys[3], 2, Some(fork_b.hash()), Some(b2.hash()), "fork-b2");
        assert!(matches!(
            x.insert_event(fork_b2),
            Err(HashgraphError::EquivocationDetected { index: 2, .. })
        ));
        assert_eq!(x.store().evidence().len(), 2);
        x.run_consensus().unwrap();
    }
}
