//! The local validator's view of the hashgraph.
//!
//! [`Core`] owns the [`Hashgraph`] and the pools of work waiting to be put
//! into the next self-event: application transactions, membership changes and
//! block signatures. It is synchronous; the node wraps it in a mutex and never
//! holds that mutex across network I/O.

use chrono::Utc;
use hashweave_hashgraph::{Hashgraph, HashgraphError, InsertOutcome};
use hashweave_protocol::{
    Block, BlockSignature, Event, EventHash, Frame, InternalTransaction, KnownIndexes, PeerId,
    PeerSet, Signer, WireEvent,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a batch of received events did to the local DAG
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub inserted: usize,
    pub duplicates: usize,
    pub rejected: usize,
    /// A self-event was created on top of the batch
    pub created: bool,
}

pub struct Core {
    id: PeerId,
    signer: Arc<dyn Signer>,
    hashgraph: Hashgraph,
    head: Option<EventHash>,
    seq: i64,
    transaction_pool: Vec<Vec<u8>>,
    internal_transaction_pool: Vec<InternalTransaction>,
    block_signature_pool: Vec<BlockSignature>,
    last_committed_block: Option<u64>,
}

impl Core {
    pub fn new(signer: Arc<dyn Signer>, hashgraph: Hashgraph) -> Result<Self, HashgraphError> {
        let id = hashweave_protocol::crypto::peer_id_from_public_key(&signer.public_key_hex())?;
        let mut core = Self {
            id,
            signer,
            hashgraph,
            head: None,
            seq: -1,
            transaction_pool: Vec::new(),
            internal_transaction_pool: Vec::new(),
            block_signature_pool: Vec::new(),
            last_committed_block: None,
        };
        core.refresh_head();
        Ok(core)
    }

    /// Create the first self-event if this validator is a member and has none.
    pub fn init(&mut self) -> Result<(), HashgraphError> {
        if self.head.is_none() && self.can_create_events() {
            self.add_self_event(None)?;
        }
        Ok(())
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn public_key_hex(&self) -> String {
        self.signer.public_key_hex()
    }

    pub fn signer(&self) -> Arc<dyn Signer> {
        self.signer.clone()
    }

    pub fn hashgraph(&self) -> &Hashgraph {
        &self.hashgraph
    }

    pub fn head(&self) -> Option<EventHash> {
        self.head
    }

    /// Index of the newest self-event, -1 before the first one.
    pub fn seq(&self) -> i64 {
        self.seq
    }

    pub fn known_events(&self) -> KnownIndexes {
        self.hashgraph.known_events()
    }

    /// Newest accepted peer set.
    pub fn peers(&self) -> PeerSet {
        self.hashgraph.current_peers()
    }

    /// Accepted peer sets keyed by effective round.
    pub fn peer_sets(&self) -> BTreeMap<i64, PeerSet> {
        self.hashgraph.peer_sets()
    }

    pub fn genesis_peers(&self) -> PeerSet {
        self.hashgraph.genesis_peers()
    }

    /// Whether there is work that needs new events to reach consensus.
    pub fn busy(&self) -> bool {
        !self.transaction_pool.is_empty()
            || !self.internal_transaction_pool.is_empty()
            || !self.block_signature_pool.is_empty()
            || self.hashgraph.pending_loaded_events() > 0
            || self.hashgraph.has_pending_peer_set()
    }

    pub fn transaction_pool_len(&self) -> usize {
        self.transaction_pool.len()
    }

    pub fn internal_transaction_pool_len(&self) -> usize {
        self.internal_transaction_pool.len()
    }

    pub fn block_signature_pool_len(&self) -> usize {
        self.block_signature_pool.len()
    }

    pub fn add_transactions(&mut self, txs: Vec<Vec<u8>>) {
        self.transaction_pool.extend(txs);
    }

    pub fn add_internal_transaction(&mut self, itx: InternalTransaction) {
        self.internal_transaction_pool.push(itx);
    }

    /// Events can only be created once this validator is in the repertoire;
    /// peers reject events from unknown creators. After a fast-forward our
    /// own newest events may be missing until a peer sends them back, and
    /// creating events before that would fork our own chain.
    pub fn can_create_events(&self) -> bool {
        let own_last = self
            .hashgraph
            .last_event_from(self.id)
            .map_or(-1, |(_, index)| index);
        own_last == self.seq
            && self
                .hashgraph
                .store()
                .backend()
                .repertoire_peer(self.id)
                .is_some()
    }

    fn refresh_head(&mut self) {
        if let Some((hash, index)) = self.hashgraph.last_event_from(self.id) {
            if index >= self.seq {
                self.head = Some(hash);
                self.seq = index;
            }
        }
    }

    /// Create, sign and insert a self-event carrying everything pooled.
    pub fn add_self_event(&mut self, other_parent: Option<EventHash>) -> Result<Option<EventHash>, HashgraphError> {
        if !self.can_create_events() {
            return Ok(None);
        }
        let transactions = std::mem::take(&mut self.transaction_pool);
        let internal_transactions = std::mem::take(&mut self.internal_transaction_pool);
        let block_signatures = std::mem::take(&mut self.block_signature_pool);

        let mut event = Event::new(
            transactions,
            internal_transactions,
            block_signatures,
            self.head,
            other_parent,
            self.signer.public_key_hex(),
            self.seq + 1,
            Utc::now(),
        );
        event.sign(self.signer.as_ref())?;

        let pooled = event.body.clone();
        match self.hashgraph.insert_event(event) {
            Ok(outcome) => {
                self.head = Some(outcome.hash());
                self.seq += 1;
                debug!(
                    "Created event {}#{} ({} txs)",
                    self.id,
                    self.seq,
                    pooled.transactions.len()
                );
                Ok(Some(outcome.hash()))
            }
            Err(e) => {
                self.transaction_pool = pooled.transactions;
                self.internal_transaction_pool = pooled.internal_transactions;
                self.block_signature_pool = pooled.block_signatures;
                Err(e)
            }
        }
    }

    /// Insert events received from `from_id`, then record the exchange with
    /// a self-event when there is something to record.
    ///
    /// Events whose parents are unknown stop the batch with an out-of-order
    /// error; the events inserted before it are kept.
    pub fn sync(&mut self, from_id: PeerId, events: Vec<WireEvent>) -> Result<SyncReport, HashgraphError> {
        let mut report = SyncReport::default();
        for wire in events {
            let event = match self.hashgraph.read_wire_info(wire) {
                Ok(event) => event,
                Err(e @ HashgraphError::OutOfOrderEvent { .. }) => {
                    self.refresh_head();
                    return Err(e);
                }
                Err(e) => {
                    warn!("⚠️ Rejected event from {}: {}", from_id, e);
                    report.rejected += 1;
                    continue;
                }
            };
            match self.hashgraph.insert_event(event) {
                Ok(InsertOutcome::Inserted(_)) => report.inserted += 1,
                Ok(InsertOutcome::Duplicate(_)) => report.duplicates += 1,
                Err(e) if e.is_recoverable() => {
                    warn!("⚠️ Rejected event from {}: {}", from_id, e);
                    report.rejected += 1;
                }
                Err(e) => return Err(e),
            }
        }
        self.refresh_head();

        if report.inserted > 0 || self.busy() {
            let other_parent = self.hashgraph.last_event_from(from_id).map(|(hash, _)| hash);
            report.created = self.add_self_event(other_parent)?.is_some();
        }
        Ok(report)
    }

    /// Events `known` is missing, capped at `limit`. The flag tells whether
    /// the list was truncated.
    pub fn event_diff(&self, known: &KnownIndexes, limit: usize) -> Result<(Vec<WireEvent>, bool), HashgraphError> {
        let diff = self.hashgraph.event_diff(known)?;
        let truncated = diff.len() > limit;
        let mut wire = Vec::with_capacity(diff.len().min(limit));
        for event in diff.into_iter().take(limit) {
            match self.hashgraph.to_wire(&event) {
                Ok(w) => wire.push(w),
                // parents below a fast-forward frame cannot be named
                Err(e) => debug!("Skipping event {}: {}", event.hash(), e),
            }
        }
        Ok((wire, truncated))
    }

    pub fn run_consensus(&mut self) -> Result<Vec<Block>, HashgraphError> {
        self.hashgraph.run_consensus()
    }

    /// Whether `index` still needs to go to the application.
    pub fn needs_commit(&self, index: u64) -> bool {
        self.last_committed_block.map_or(true, |last| index > last)
    }

    /// Record the application's state hash for a block and sign it. The
    /// signature is applied locally and pooled for the next self-event.
    pub fn commit(&mut self, index: u64, state_hash: Vec<u8>) -> Result<BlockSignature, HashgraphError> {
        let block = self.hashgraph.set_block_state_hash(index, state_hash)?;
        let signature = block.sign(self.signer.as_ref())?;
        self.hashgraph.add_block_signature(signature.clone())?;
        self.block_signature_pool.push(signature.clone());
        self.last_committed_block = Some(index);
        debug!("✍️ Signed block {}", index);
        Ok(signature)
    }

    pub fn anchor(&self) -> Option<(Block, Frame)> {
        self.hashgraph.anchor()
    }

    /// Restart from a validated frame and block. Pools are kept, and so is
    /// our sequence number: events we created above the frame must come back
    /// through sync before we create new ones.
    pub fn fast_forward(&mut self, block: Block, frame: Frame) -> Result<(), HashgraphError> {
        let index = block.index();
        self.hashgraph.reset(block, frame)?;
        self.head = None;
        self.refresh_head();
        self.last_committed_block = Some(index);
        if self.head.is_none() && self.seq >= 0 {
            info!("⏩ Core fast-forwarded to block {}, waiting for own events up to {}", index, self.seq);
        } else {
            info!("⏩ Core fast-forwarded to block {}, own head at index {}", index, self.seq);
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), HashgraphError> {
        self.hashgraph.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashweave_hashgraph::{ConsensusConfig, InmemStore};
    use hashweave_protocol::{KeyPair, Peer};

    fn cores(n: usize) -> Vec<Core> {
        let keys: Vec<KeyPair> = (0..n).map(|_| KeyPair::generate()).collect();
        let peers = PeerSet::new(
            keys.iter()
                .enumerate()
                .map(|(i, k)| Peer::new(k.public_key_hex(), format!("addr{}", i), format!("node{}", i)))
                .collect(),
        )
        .unwrap();
        keys.into_iter()
            .map(|key| {
                let hashgraph = Hashgraph::new(
                    Box::new(InmemStore::with_genesis(peers.clone())),
                    ConsensusConfig::default(),
                );
                let mut core = Core::new(Arc::new(key), hashgraph).unwrap();
                core.init().unwrap();
                core
            })
            .collect()
    }

    /// Pull `from` into `to`, the way a sync round trip does.
    fn pull(cores: &mut [Core], to: usize, from: usize) -> SyncReport {
        let known = cores[to].known_events();
        let (events, truncated) = cores[from].event_diff(&known, 1000).unwrap();
        assert!(!truncated);
        let from_id = cores[from].id();
        cores[to].sync(from_id, events).unwrap()
    }

    #[test]
    fn test_init_creates_root_event() {
        let cores = cores(3);
        for core in &cores {
            assert_eq!(core.seq(), 0);
            assert!(core.head().is_some());
            assert_eq!(core.known_events().get(&core.id()), Some(&0));
        }
    }

    #[test]
    fn test_sync_inserts_and_creates_self_event() {
        let mut cores = cores(3);
        cores[0].add_transactions(vec![b"tx".to_vec()]);

        let report = pull(&mut cores, 1, 0);
        assert_eq!(report.inserted, 1);
        assert!(report.created);
        assert_eq!(cores[1].seq(), 1);

        // the new event points at core 0's root
        let head = cores[1].hashgraph().get_event(&cores[1].head().unwrap()).unwrap();
        let (root0, _) = cores[1].hashgraph().last_event_from(cores[0].id()).unwrap();
        assert_eq!(head.other_parent(), Some(root0));

        // nothing new and nothing pooled: no event
        let report = pull(&mut cores, 1, 0);
        assert_eq!(report.inserted, 0);
        assert!(!report.created);
    }

    #[test]
    fn test_pooled_work_goes_into_next_event() {
        let mut cores = cores(2);
        cores[0].add_transactions(vec![b"a".to_vec(), b"b".to_vec()]);
        assert!(cores[0].busy());
        let hash = cores[0].add_self_event(None).unwrap().unwrap();

        let event = cores[0].hashgraph().get_event(&hash).unwrap();
        assert_eq!(event.transactions().len(), 2);
        assert_eq!(cores[0].transaction_pool_len(), 0);
    }

    #[test]
    fn test_out_of_order_batch_keeps_prefix() {
        let mut cores = cores(3);
        pull(&mut cores, 1, 0);
        pull(&mut cores, 2, 1);

        let (mut events, _) = cores[2].event_diff(&Default::default(), 1000).unwrap();
        // without core 1's root, its next event cannot be resolved
        let id1 = cores[1].id();
        events.retain(|e| !(e.body.creator_id == id1 && e.body.index == 0));
        let id2 = cores[2].id();
        let result = cores[0].sync(id2, events);
        assert!(matches!(result, Err(HashgraphError::OutOfOrderEvent { .. })));
        // core 2's root sorts before the failing event and was kept
        assert_eq!(cores[0].known_events().get(&id2), Some(&0));
        assert_eq!(cores[0].known_events().get(&id1), Some(&-1));
    }

    #[test]
    fn test_event_diff_truncates() {
        let mut cores = cores(3);
        pull(&mut cores, 1, 0);
        pull(&mut cores, 2, 1);
        let (events, truncated) = cores[2].event_diff(&Default::default(), 2).unwrap();
        assert_eq!(events.len(), 2);
        assert!(truncated);
    }
}
