//! Block creation, signature collection and anchor tracking.

use chrono::{DateTime, Utc};
use hashweave_protocol::{Block, BlockSignature, Event, Frame, PeerSet};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::errors::HashgraphError;
use crate::store::Store;

/// How far past the next block index an early signature is still held
const MAX_PENDING_AHEAD: u64 = 64;

/// Turns consensus rounds into blocks and gathers validator signatures.
#[derive(Debug, Default)]
pub struct BlockManager {
    /// Index of the most recent block, if any
    last_block_index: Option<u64>,
    /// Most recent block signed by at least `trust_count` of stake
    anchor_block: Option<u64>,
    /// Signatures for blocks that do not exist locally or are not yet committed
    pending_signatures: BTreeMap<u64, Vec<BlockSignature>>,
}

impl BlockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild counters from persisted blocks.
    pub fn from_store(store: &dyn Store) -> Self {
        let mut manager = Self {
            last_block_index: store.last_block_index(),
            ..Self::default()
        };
        if let Some(last) = manager.last_block_index {
            for index in (0..=last).rev() {
                let Some(block) = store.get_block(index) else {
                    break;
                };
                if let Some(peers) = store.peer_set_for_round(block.round_received()) {
                    if block.signed_stake(&peers) >= peers.trust_count() {
                        manager.anchor_block = Some(index);
                        break;
                    }
                }
            }
        }
        manager
    }

    pub fn last_block_index(&self) -> Option<u64> {
        self.last_block_index
    }

    pub fn next_index(&self) -> u64 {
        self.last_block_index.map_or(0, |i| i + 1)
    }

    pub fn anchor_block(&self) -> Option<u64> {
        self.anchor_block
    }

    /// Build the block for a processed round from its received events, or
    /// `None` when the round carried no transactions.
    pub fn create_block(
        &mut self,
        store: &mut dyn Store,
        frame: &Frame,
        received: &[Arc<Event>],
    ) -> Result<Option<Block>, HashgraphError> {
        let transactions: Vec<Vec<u8>> = received
            .iter()
            .flat_map(|e| e.transactions().iter().cloned())
            .collect();
        let internal_transactions: Vec<_> = received
            .iter()
            .flat_map(|e| e.internal_transactions().iter().cloned())
            .collect();
        if transactions.is_empty() && internal_transactions.is_empty() {
            return Ok(None);
        }

        let timestamp: DateTime<Utc> = received
            .last()
            .and_then(|e| e.meta.consensus_timestamp)
            .unwrap_or_else(Utc::now);

        let block = Block::new(
            self.next_index(),
            frame.round,
            timestamp,
            frame.hash()?,
            frame.peers.hash()?,
            transactions,
            internal_transactions,
        );
        store.set_frame(frame.clone())?;
        store.set_block(block.clone())?;
        self.last_block_index = Some(block.index());

        info!(
            "📦 Block {} created for round {} ({} transactions)",
            block.index(),
            frame.round,
            block.transactions().len()
        );
        Ok(Some(block))
    }

    /// Record the application state hash of a committed block.
    ///
    /// The state hash is written once; signatures that arrived before it are
    /// applied afterwards.
    pub fn set_state_hash(
        &mut self,
        store: &mut dyn Store,
        index: u64,
        state_hash: Vec<u8>,
    ) -> Result<Block, HashgraphError> {
        let mut block = store
            .get_block(index)
            .ok_or_else(|| HashgraphError::invalid(format!("block {} not found", index)))?;
        if block.body.state_hash.is_empty() {
            block.body.state_hash = state_hash;
            block.signatures.clear();
            store.set_block(block.clone())?;
        } else if block.body.state_hash != state_hash {
            warn!("⚠️ Block {} state hash differs from the committed one", index);
        }

        if let Some(pending) = self.pending_signatures.remove(&index) {
            for sig in pending {
                self.add_signature(store, sig)?;
            }
        }
        store
            .get_block(index)
            .ok_or_else(|| HashgraphError::invalid(format!("block {} not found", index)))
    }

    /// Attach a validator signature to a block. Returns whether it was applied.
    pub fn add_signature(
        &mut self,
        store: &mut dyn Store,
        sig: BlockSignature,
    ) -> Result<bool, HashgraphError> {
        let Some(mut block) = store.get_block(sig.index) else {
            if self.last_block_index.map_or(true, |last| sig.index > last) {
                self.hold_signature(store, sig);
            }
            return Ok(false);
        };
        if block.body.state_hash.is_empty() {
            self.hold_signature(store, sig);
            return Ok(false);
        }
        if block.signatures.contains_key(&sig.validator) {
            return Ok(false);
        }

        let peers = store
            .peer_set_for_round(block.round_received())
            .unwrap_or_default();
        let validator = match sig.validator_id() {
            Ok(id) => id,
            Err(_) => return Ok(false),
        };
        if !peers.contains(validator) {
            debug!("Ignoring signature from non-validator {} on block {}", validator, sig.index);
            return Ok(false);
        }
        if !block.verify_signature(&sig)? {
            warn!("⚠️ Invalid signature from {} on block {}", validator, sig.index);
            return Ok(false);
        }

        block.set_signature(sig);
        self.update_anchor(&block, &peers);
        store.set_block(block)?;
        Ok(true)
    }

    /// Keep a signature until its block is built and committed. Only one
    /// signature per validator and block is held, from known validators and
    /// for blocks at most `MAX_PENDING_AHEAD` past the next index.
    fn hold_signature(&mut self, store: &dyn Store, sig: BlockSignature) {
        if sig.index > self.next_index() + MAX_PENDING_AHEAD {
            debug!("Dropping signature for block {}, too far ahead", sig.index);
            return;
        }
        let Ok(validator) = sig.validator_id() else {
            return;
        };
        if !store.peer_sets().values().any(|peers| peers.contains(validator)) {
            debug!("Dropping early signature from non-validator {}", validator);
            return;
        }
        let held = self.pending_signatures.entry(sig.index).or_default();
        if held.iter().all(|other| other.validator != sig.validator) {
            held.push(sig);
        }
    }

    fn update_anchor(&mut self, block: &Block, peers: &PeerSet) {
        if self.anchor_block.map_or(true, |a| block.index() > a)
            && block.signed_stake(peers) >= peers.trust_count()
        {
            debug!("⚓ Anchor block is now {}", block.index());
            self.anchor_block = Some(block.index());
        }
    }

    /// Restart numbering after a fast-forward to `block`.
    pub fn reset(&mut self, block: &Block) {
        self.last_block_index = Some(block.index());
        self.anchor_block = Some(block.index());
        self.pending_signatures.retain(|index, _| *index > block.index());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InmemStore;
    use hashweave_protocol::{KeyPair, Peer, Signer};

    fn early_signature(key: &KeyPair, index: u64) -> BlockSignature {
        let block = Block::new(index, 0, Utc::now(), "frame".to_string(), "peers".to_string(), vec![], vec![]);
        block.sign(key).unwrap()
    }

    fn held(manager: &BlockManager) -> usize {
        manager.pending_signatures.values().map(Vec::len).sum()
    }

    #[test]
    fn test_early_signatures_are_bounded() {
        let keys: Vec<KeyPair> = (0..2).map(|_| KeyPair::generate()).collect();
        let peers = PeerSet::new(
            keys.iter()
                .enumerate()
                .map(|(i, k)| Peer::new(k.public_key_hex(), format!("addr{}", i), format!("node{}", i)))
                .collect(),
        )
        .unwrap();
        let mut store = InmemStore::with_genesis(peers);
        let mut manager = BlockManager::new();

        assert!(!manager.add_signature(&mut store, early_signature(&keys[0], 3)).unwrap());
        assert_eq!(held(&manager), 1);

        // the same validator again, and a validator nobody knows
        assert!(!manager.add_signature(&mut store, early_signature(&keys[0], 3)).unwrap());
        let outsider = KeyPair::generate();
        assert!(!manager.add_signature(&mut store, early_signature(&outsider, 3)).unwrap());
        assert_eq!(held(&manager), 1);

        assert!(!manager
            .add_signature(&mut store, early_signature(&keys[1], MAX_PENDING_AHEAD + 1))
            .unwrap());
        assert!(!manager.add_signature(&mut store, early_signature(&keys[1], 10_000)).unwrap());
        assert_eq!(held(&manager), 1);
        assert_eq!(manager.pending_signatures.keys().collect::<Vec<_>>(), vec![&3]);
    }
}
