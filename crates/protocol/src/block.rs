//! Blocks and frames.
//!
//! A [`Block`] bundles the transactions of one consensus round in their final
//! order. A [`Frame`] is the consensus snapshot a block is produced from; it
//! holds enough events and peer-set history for a node to resume consensus
//! without the full DAG.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::crypto::{hash_with_domain, verify, Signer};
use crate::errors::ProtocolError;
use crate::events::{BlockSignature, Event, InternalTransaction};
use crate::peers::PeerSet;

/// Signed contents of a block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockBody {
    /// Sequence number, starting at zero
    pub index: u64,
    /// Consensus round the transactions were received in
    pub round_received: i64,
    /// Consensus timestamp of the last event of the round
    pub timestamp: DateTime<Utc>,
    /// Application state hash after applying the block
    #[serde(with = "crate::encoding::hex_bytes")]
    pub state_hash: Vec<u8>,
    /// Hash of the frame the block was produced from
    pub frame_hash: String,
    /// Hash of the peer set in force at `round_received`
    pub peers_hash: String,
    #[serde(with = "crate::encoding::hex_list")]
    pub transactions: Vec<Vec<u8>>,
    pub internal_transactions: Vec<InternalTransaction>,
}

impl BlockBody {
    pub fn hash(&self) -> Result<[u8; 32], ProtocolError> {
        let json = serde_json::to_vec(self)?;
        Ok(hash_with_domain("hashweave.block.v1", &json))
    }
}

/// A block of consensus-ordered transactions with validator signatures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub body: BlockBody,
    /// Validator public key (hex) to signature (hex)
    pub signatures: BTreeMap<String, String>,
}

impl Block {
    pub fn new(
        index: u64,
        round_received: i64,
        timestamp: DateTime<Utc>,
        frame_hash: String,
        peers_hash: String,
        transactions: Vec<Vec<u8>>,
        internal_transactions: Vec<InternalTransaction>,
    ) -> Self {
        Self {
            body: BlockBody {
                index,
                round_received,
                timestamp,
                state_hash: Vec::new(),
                frame_hash,
                peers_hash,
                transactions,
                internal_transactions,
            },
            signatures: BTreeMap::new(),
        }
    }

    pub fn index(&self) -> u64 {
        self.body.index
    }

    pub fn round_received(&self) -> i64 {
        self.body.round_received
    }

    pub fn transactions(&self) -> &[Vec<u8>] {
        &self.body.transactions
    }

    pub fn internal_transactions(&self) -> &[InternalTransaction] {
        &self.body.internal_transactions
    }

    /// Hex hash of the block body.
    pub fn hash(&self) -> Result<String, ProtocolError> {
        Ok(hex::encode(self.body.hash()?))
    }

    /// Produce this validator's signature over the body.
    pub fn sign(&self, signer: &dyn Signer) -> Result<BlockSignature, ProtocolError> {
        let hash = self.body.hash()?;
        Ok(BlockSignature {
            validator: signer.public_key_hex(),
            index: self.body.index,
            signature: signer.sign(&hash),
        })
    }

    pub fn verify_signature(&self, sig: &BlockSignature) -> Result<bool, ProtocolError> {
        if sig.index != self.body.index {
            return Ok(false);
        }
        let hash = self.body.hash()?;
        verify(&sig.validator, &hash, &sig.signature)
    }

    pub fn set_signature(&mut self, sig: BlockSignature) {
        self.signatures.insert(sig.validator, sig.signature);
    }

    /// Stake of the members of `peers` holding a valid signature on this block.
    pub fn signed_stake(&self, peers: &PeerSet) -> u64 {
        let Ok(hash) = self.body.hash() else {
            return 0;
        };
        let mut stake = 0;
        for (_, peer) in peers.peers() {
            if let Some(signature) = self.signatures.get(&peer.pub_key_hex) {
                if verify(&peer.pub_key_hex, &hash, signature).unwrap_or(false) {
                    stake += peer.stake;
                }
            }
        }
        stake
    }
}

/// Consensus snapshot a block is produced from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Frame {
    /// Round the frame closes
    pub round: i64,
    /// Peer set in force at `round`
    pub peers: PeerSet,
    /// Every peer set change so far, keyed by effective round
    pub peer_sets: BTreeMap<i64, PeerSet>,
    /// Events with their consensus metadata, in topological order
    pub events: Vec<Event>,
}

impl Frame {
    /// Hex hash of the frame.
    pub fn hash(&self) -> Result<String, ProtocolError> {
        let json = serde_json::to_vec(self)?;
        Ok(hex::encode(hash_with_domain("hashweave.frame.v1", &json)))
    }
}
