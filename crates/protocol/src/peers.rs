//! Validator peers and immutable peer sets.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::crypto::{hash_with_domain, peer_id_from_public_key};
use crate::errors::ProtocolError;
use crate::PeerId;

fn default_stake() -> u64 {
    1
}

/// A validator taking part in consensus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Peer {
    /// Hex-encoded Ed25519 public key
    pub pub_key_hex: String,
    /// Transport address the peer can be reached at
    pub net_addr: String,
    /// Human-readable name
    #[serde(default)]
    pub moniker: String,
    /// Voting weight
    #[serde(default = "default_stake")]
    pub stake: u64,
}

impl Peer {
    /// Create a peer with the default stake of one.
    pub fn new(pub_key_hex: impl Into<String>, net_addr: impl Into<String>, moniker: impl Into<String>) -> Self {
        Self {
            pub_key_hex: pub_key_hex.into(),
            net_addr: net_addr.into(),
            moniker: moniker.into(),
            stake: default_stake(),
        }
    }

    /// Peer id derived from the public key.
    pub fn id(&self) -> Result<PeerId, ProtocolError> {
        peer_id_from_public_key(&self.pub_key_hex)
    }
}

/// An immutable, deterministically ordered set of validators.
///
/// Peers are kept sorted by id. Sets are never modified in place: membership
/// changes produce a new set through [`PeerSet::with_new_peer`] and
/// [`PeerSet::with_removed_peer`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Peer>", into = "Vec<Peer>")]
pub struct PeerSet {
    peers: BTreeMap<PeerId, Peer>,
}

impl TryFrom<Vec<Peer>> for PeerSet {
    type Error = ProtocolError;

    fn try_from(peers: Vec<Peer>) -> Result<Self, Self::Error> {
        PeerSet::new(peers)
    }
}

impl From<PeerSet> for Vec<Peer> {
    fn from(set: PeerSet) -> Self {
        set.peers.into_values().collect()
    }
}

impl PeerSet {
    /// Build a set from a list of peers, rejecting duplicates and zero stake.
    pub fn new(peers: Vec<Peer>) -> Result<Self, ProtocolError> {
        let mut map = BTreeMap::new();
        for peer in peers {
            if peer.stake == 0 {
                return Err(ProtocolError::ValidationFailed {
                    reason: format!("peer {} has zero stake", peer.moniker),
                });
            }
            let id = peer.id()?;
            if map.insert(id, peer).is_some() {
                return Err(ProtocolError::ValidationFailed {
                    reason: format!("duplicate peer id {}", id),
                });
            }
        }
        Ok(Self { peers: map })
    }

    /// Parse a JSON array of peers.
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize as a JSON array of peers.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Peers in id order.
    pub fn peers(&self) -> impl Iterator<Item = (&PeerId, &Peer)> {
        self.peers.iter()
    }

    /// Peer ids in ascending order.
    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    pub fn to_vec(&self) -> Vec<Peer> {
        self.peers.values().cloned().collect()
    }

    pub fn by_id(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Stake of a peer, zero for non-members.
    pub fn stake_of(&self, id: PeerId) -> u64 {
        self.peers.get(&id).map(|p| p.stake).unwrap_or(0)
    }

    pub fn total_stake(&self) -> u64 {
        self.peers.values().map(|p| p.stake).sum()
    }

    /// Largest faulty stake the set tolerates: `(W - 1) / 3`.
    pub fn fault_tolerance(&self) -> u64 {
        self.total_stake().saturating_sub(1) / 3
    }

    /// Smallest stake of a Byzantine quorum: strictly more than `(W + f) / 2`.
    ///
    /// For `W = 3f + 1` this is the usual `2f + 1`; three validators of stake
    /// one need two of them.
    pub fn super_majority(&self) -> u64 {
        (self.total_stake() + self.fault_tolerance()) / 2 + 1
    }

    /// Stake guaranteeing at least one honest member: `f + 1`.
    pub fn trust_count(&self) -> u64 {
        self.fault_tolerance() + 1
    }

    /// New set with `peer` added.
    pub fn with_new_peer(&self, peer: Peer) -> Result<Self, ProtocolError> {
        let id = peer.id()?;
        if self.peers.contains_key(&id) {
            return Err(ProtocolError::ValidationFailed {
                reason: format!("peer {} is already a member", id),
            });
        }
        if peer.stake == 0 {
            return Err(ProtocolError::ValidationFailed {
                reason: format!("peer {} has zero stake", id),
            });
        }
        let mut peers = self.peers.clone();
        peers.insert(id, peer);
        Ok(Self { peers })
    }

    /// New set with the peer `id` removed. The last member cannot leave.
    pub fn with_removed_peer(&self, id: PeerId) -> Result<Self, ProtocolError> {
        if !self.peers.contains_key(&id) {
            return Err(ProtocolError::UnknownPeer { peer_id: id });
        }
        if self.peers.len() == 1 {
            return Err(ProtocolError::ValidationFailed {
                reason: "cannot remove the last peer".to_string(),
            });
        }
        let mut peers = self.peers.clone();
        peers.remove(&id);
        Ok(Self { peers })
    }

    /// Hex hash identifying the set's contents.
    pub fn hash(&self) -> Result<String, ProtocolError> {
        let json = serde_json::to_vec(self)?;
        Ok(hex::encode(hash_with_domain("hashweave.peerset.v1", &json)))
    }
}
