//! Hashgraph event definitions.
//!
//! An [`Event`] is the unit of gossip: it is created and signed by one
//! validator, points at its creator's previous event (self-parent) and at one
//! event learned from another peer (other-parent), and carries transactions.
//! Its identity is the Blake3 hash of its signed contents. [`WireEvent`] is the
//! compact network form where parents are given as `(creator, index)`
//! coordinates instead of hashes.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use crate::crypto::{peer_id_from_bytes, verify, Signer};
use crate::errors::ProtocolError;
use crate::peers::Peer;
use crate::PeerId;

/// Blake3 hash identifying an event.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct EventHash(pub [u8; 32]);

impl EventHash {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, ProtocolError> {
        let bytes = hex::decode(s)?;
        let array: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ProtocolError::InvalidFormat {
                reason: "event hash must be 32 bytes".to_string(),
            })?;
        Ok(EventHash(array))
    }
}

impl fmt::Display for EventHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for EventHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventHash({})", &self.to_hex()[..12])
    }
}

impl Serialize for EventHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for EventHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        EventHash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Membership change carried by an internal transaction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransactionKind {
    /// Add the peer to the validator set
    PeerAdd,
    /// Remove the peer from the validator set
    PeerRemove,
}

/// Signed contents of an internal transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InternalTransactionBody {
    pub kind: TransactionKind,
    pub peer: Peer,
}

/// A membership proposal, signed by the peer it concerns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InternalTransaction {
    pub body: InternalTransactionBody,
    /// Hex signature by `body.peer`'s key
    pub signature: String,
}

impl InternalTransaction {
    /// Create an unsigned proposal.
    pub fn new(kind: TransactionKind, peer: Peer) -> Self {
        Self {
            body: InternalTransactionBody { kind, peer },
            signature: String::new(),
        }
    }

    fn signing_payload(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(b"HASHWEAVE_ITX_V1\n");
        let kind: &[u8] = match self.body.kind {
            TransactionKind::PeerAdd => b"add",
            TransactionKind::PeerRemove => b"remove",
        };
        push_field(&mut payload, kind);
        push_field(&mut payload, self.body.peer.pub_key_hex.as_bytes());
        push_field(&mut payload, self.body.peer.net_addr.as_bytes());
        push_field(&mut payload, self.body.peer.moniker.as_bytes());
        payload.extend_from_slice(&self.body.peer.stake.to_be_bytes());
        payload
    }

    /// Sign with the key of the peer being added or removed.
    pub fn sign(&mut self, signer: &dyn Signer) -> Result<(), ProtocolError> {
        if signer.public_key_hex() != self.body.peer.pub_key_hex {
            return Err(ProtocolError::ValidationFailed {
                reason: "internal transaction must be signed by the peer it concerns".to_string(),
            });
        }
        self.signature = signer.sign(&self.signing_payload());
        Ok(())
    }

    /// Check the signature against the concerned peer's key.
    pub fn verify(&self) -> Result<bool, ProtocolError> {
        if self.signature.is_empty() {
            return Ok(false);
        }
        verify(&self.body.peer.pub_key_hex, &self.signing_payload(), &self.signature)
    }

    /// Hex hash of the signed proposal.
    pub fn hash(&self) -> String {
        let mut hasher = blake3::Hasher::new_derive_key("hashweave.itx.v1");
        hasher.update(&self.signing_payload());
        hasher.update(self.signature.as_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

/// A validator's signature over a committed block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockSignature {
    /// Hex public key of the signing validator
    pub validator: String,
    /// Index of the signed block
    pub index: u64,
    /// Hex signature over the block body hash
    pub signature: String,
}

impl BlockSignature {
    pub fn validator_id(&self) -> Result<PeerId, ProtocolError> {
        crate::crypto::peer_id_from_public_key(&self.validator)
    }
}

/// Signed contents of an event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventBody {
    /// Raw application transactions
    #[serde(with = "crate::encoding::hex_list")]
    pub transactions: Vec<Vec<u8>>,
    /// Membership proposals
    pub internal_transactions: Vec<InternalTransaction>,
    /// Signatures over previously committed blocks
    pub block_signatures: Vec<BlockSignature>,
    /// Creator's previous event, absent for its first event
    pub self_parent: Option<EventHash>,
    /// Event received from another peer
    pub other_parent: Option<EventHash>,
    /// Hex public key of the creator
    pub creator: String,
    /// Creator sequence number, starting at zero
    pub index: i64,
    /// Creation time claimed by the creator
    pub timestamp: DateTime<Utc>,
}

/// Consensus metadata the hashgraph derives for a stored event.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventMeta {
    /// Assigned round, once computed
    pub round: Option<i64>,
    /// Longest parent chain length
    pub lamport_timestamp: i64,
    /// First event of its creator in its round
    pub witness: bool,
    /// Highest index per creator among this event's ancestors (itself included)
    pub last_ancestors: BTreeMap<PeerId, i64>,
    /// Lowest index per creator among this event's descendants (itself included)
    pub first_descendants: BTreeMap<PeerId, i64>,
    /// Round in which the event entered the total order
    pub round_received: Option<i64>,
    /// Median receive time assigned by the famous witnesses
    pub consensus_timestamp: Option<DateTime<Utc>>,
}

/// An event of the hashgraph with its derived consensus metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub body: EventBody,
    /// Hex signature by the creator over the event hash
    pub signature: String,
    #[serde(default)]
    pub meta: EventMeta,
    #[serde(skip)]
    hash: OnceLock<EventHash>,
    #[serde(skip)]
    creator_id: OnceLock<PeerId>,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.body == other.body && self.signature == other.signature && self.meta == other.meta
    }
}

impl Eq for Event {}

fn push_field(buf: &mut Vec<u8>, field: &[u8]) {
    buf.extend_from_slice(&(field.len() as u64).to_be_bytes());
    buf.extend_from_slice(field);
}

fn push_parent(buf: &mut Vec<u8>, parent: &Option<EventHash>) {
    match parent {
        Some(hash) => {
            buf.push(1);
            buf.extend_from_slice(&hash.0);
        }
        None => buf.push(0),
    }
}

impl Event {
    /// Create an unsigned event.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transactions: Vec<Vec<u8>>,
        internal_transactions: Vec<InternalTransaction>,
        block_signatures: Vec<BlockSignature>,
        self_parent: Option<EventHash>,
        other_parent: Option<EventHash>,
        creator: String,
        index: i64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self::from_body(
            EventBody {
                transactions,
                internal_transactions,
                block_signatures,
                self_parent,
                other_parent,
                creator,
                index,
                timestamp,
            },
            String::new(),
        )
    }

    /// Wrap a body and signature, with empty metadata.
    pub fn from_body(body: EventBody, signature: String) -> Self {
        Self {
            body,
            signature,
            meta: EventMeta::default(),
            hash: OnceLock::new(),
            creator_id: OnceLock::new(),
        }
    }

    /// Canonical byte encoding of the body, the input of the event hash.
    fn canonical_bytes(&self) -> Vec<u8> {
        let body = &self.body;
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(b"HASHWEAVE_EVENT_V1\n");
        push_field(&mut buf, body.creator.as_bytes());
        buf.extend_from_slice(&body.index.to_be_bytes());
        push_parent(&mut buf, &body.self_parent);
        push_parent(&mut buf, &body.other_parent);
        push_field(
            &mut buf,
            body.timestamp
                .to_rfc3339_opts(SecondsFormat::Nanos, true)
                .as_bytes(),
        );
        buf.extend_from_slice(&(body.transactions.len() as u64).to_be_bytes());
        for tx in &body.transactions {
            push_field(&mut buf, tx);
        }
        buf.extend_from_slice(&(body.internal_transactions.len() as u64).to_be_bytes());
        for itx in &body.internal_transactions {
            push_field(&mut buf, itx.hash().as_bytes());
        }
        buf.extend_from_slice(&(body.block_signatures.len() as u64).to_be_bytes());
        for sig in &body.block_signatures {
            push_field(&mut buf, sig.validator.as_bytes());
            buf.extend_from_slice(&sig.index.to_be_bytes());
            push_field(&mut buf, sig.signature.as_bytes());
        }
        buf
    }

    /// Content hash of the event.
    pub fn hash(&self) -> EventHash {
        *self.hash.get_or_init(|| {
            let mut hasher = blake3::Hasher::new_derive_key("hashweave.event.v1");
            hasher.update(&self.canonical_bytes());
            EventHash(*hasher.finalize().as_bytes())
        })
    }

    /// Sign the event hash. The signer must be the declared creator.
    pub fn sign(&mut self, signer: &dyn Signer) -> Result<(), ProtocolError> {
        if signer.public_key_hex() != self.body.creator {
            return Err(ProtocolError::ValidationFailed {
                reason: "signer does not match event creator".to_string(),
            });
        }
        self.signature = signer.sign(&self.hash().0);
        Ok(())
    }

    /// Verify the creator signature over the event hash.
    pub fn verify(&self) -> Result<bool, ProtocolError> {
        if self.signature.is_empty() {
            return Ok(false);
        }
        verify(&self.body.creator, &self.hash().0, &self.signature)
    }

    /// Peer id of the creator.
    pub fn creator_id(&self) -> PeerId {
        *self.creator_id.get_or_init(|| match hex::decode(&self.body.creator) {
            Ok(bytes) => peer_id_from_bytes(&bytes),
            Err(_) => peer_id_from_bytes(self.body.creator.as_bytes()),
        })
    }

    pub fn index(&self) -> i64 {
        self.body.index
    }

    pub fn self_parent(&self) -> Option<EventHash> {
        self.body.self_parent
    }

    pub fn other_parent(&self) -> Option<EventHash> {
        self.body.other_parent
    }

    pub fn transactions(&self) -> &[Vec<u8>] {
        &self.body.transactions
    }

    pub fn internal_transactions(&self) -> &[InternalTransaction] {
        &self.body.internal_transactions
    }

    pub fn block_signatures(&self) -> &[BlockSignature] {
        &self.body.block_signatures
    }

    /// Whether the event carries anything for the application or membership.
    pub fn is_loaded(&self) -> bool {
        !self.body.transactions.is_empty() || !self.body.internal_transactions.is_empty()
    }

    pub fn round(&self) -> Option<i64> {
        self.meta.round
    }

    pub fn round_received(&self) -> Option<i64> {
        self.meta.round_received
    }

    pub fn is_witness(&self) -> bool {
        self.meta.witness
    }

    /// Raw signature bytes, empty if the hex is malformed.
    pub fn signature_bytes(&self) -> Vec<u8> {
        hex::decode(&self.signature).unwrap_or_default()
    }

    /// Event without derived metadata.
    pub fn stripped(&self) -> Event {
        Event::from_body(self.body.clone(), self.signature.clone())
    }

    /// Project onto the wire form. `other_parent` gives the coordinates of the
    /// other-parent, which only the store can resolve.
    pub fn to_wire(&self, other_parent: Option<(PeerId, i64)>) -> WireEvent {
        let (other_parent_creator_id, other_parent_index) = match other_parent {
            Some((creator, index)) => (Some(creator), index),
            None => (None, -1),
        };
        WireEvent {
            body: WireBody {
                transactions: self.body.transactions.clone(),
                internal_transactions: self.body.internal_transactions.clone(),
                block_signatures: self.body.block_signatures.clone(),
                creator_id: self.creator_id(),
                index: self.body.index,
                self_parent_index: self.body.index - 1,
                other_parent_creator_id,
                other_parent_index,
                self_parent_hash: self.body.self_parent,
                other_parent_hash: self.body.other_parent,
                timestamp: self.body.timestamp,
            },
            signature: self.signature.clone(),
        }
    }

    /// Rebuild an event from its wire form once the creator key and the parent
    /// hashes have been resolved.
    pub fn from_wire(
        wire: WireEvent,
        creator_pub_key: String,
        self_parent: Option<EventHash>,
        other_parent: Option<EventHash>,
    ) -> Event {
        let WireEvent { body, signature } = wire;
        Event::from_body(
            EventBody {
                transactions: body.transactions,
                internal_transactions: body.internal_transactions,
                block_signatures: body.block_signatures,
                self_parent,
                other_parent,
                creator: creator_pub_key,
                index: body.index,
                timestamp: body.timestamp,
            },
            signature,
        )
    }
}

/// Network body of an event: parents as creator coordinates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireBody {
    #[serde(with = "crate::encoding::hex_list")]
    pub transactions: Vec<Vec<u8>>,
    pub internal_transactions: Vec<InternalTransaction>,
    pub block_signatures: Vec<BlockSignature>,
    pub creator_id: PeerId,
    pub index: i64,
    /// `index - 1`, or -1 for a creator's first event
    pub self_parent_index: i64,
    pub other_parent_creator_id: Option<PeerId>,
    /// -1 when there is no other-parent
    pub other_parent_index: i64,
    /// Exact parent hashes. Coordinates alone are ambiguous once a creator
    /// has forked its chain.
    #[serde(default)]
    pub self_parent_hash: Option<EventHash>,
    #[serde(default)]
    pub other_parent_hash: Option<EventHash>,
    pub timestamp: DateTime<Utc>,
}

/// Serializable projection of an [`Event`] exchanged between peers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireEvent {
    pub body: WireBody,
    pub signature: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn signed_event(key: &KeyPair, index: i64, self_parent: Option<EventHash>) -> Event {
        let mut event = Event::new(
            vec![b"tx one".to_vec(), b"tx two".to_vec()],
            vec![],
            vec![],
            self_parent,
            None,
            key.public_key_hex(),
            index,
            Utc::now(),
        );
        event.sign(key).unwrap();
        event
    }

    #[test]
    fn test_event_signature() {
        let key = KeyPair::generate();
        let event = signed_event(&key, 0, None);
        assert!(event.verify().unwrap());
        assert_eq!(event.creator_id(), key.peer_id());

        let mut tampered = event.clone();
        tampered.body.transactions.push(b"forged".to_vec());
        let tampered = Event::from_body(tampered.body, tampered.signature);
        assert!(!tampered.verify().unwrap());
    }

    #[test]
    fn test_sign_requires_creator_key() {
        let key = KeyPair::generate();
        let other = KeyPair::generate();
        let mut event = signed_event(&key, 0, None);
        assert!(event.sign(&other).is_err());
    }

    #[test]
    fn test_hash_covers_parents_and_metadata_does_not() {
        let key = KeyPair::generate();
        let first = signed_event(&key, 0, None);
        let second = signed_event(&key, 1, Some(first.hash()));
        assert_ne!(first.hash(), second.hash());

        let mut with_meta = second.clone();
        with_meta.meta.round = Some(3);
        assert_eq!(with_meta.hash(), second.hash());
    }

    #[test]
    fn test_wire_round_trip() {
        let key = KeyPair::generate();
        let first = signed_event(&key, 0, None);
        let second = signed_event(&key, 1, Some(first.hash()));

        let wire = second.to_wire(None);
        assert_eq!(wire.body.self_parent_index, 0);
        assert_eq!(wire.body.other_parent_index, -1);
        assert_eq!(wire.body.self_parent_hash, Some(first.hash()));
        assert_eq!(wire.body.other_parent_hash, None);

        let json = serde_json::to_string(&wire).unwrap();
        let decoded: WireEvent = serde_json::from_str(&json).unwrap();
        let rebuilt = Event::from_wire(decoded, key.public_key_hex(), Some(first.hash()), None);

        assert_eq!(rebuilt.hash(), second.hash());
        assert_eq!(rebuilt.transactions(), second.transactions());
        assert!(rebuilt.verify().unwrap());
    }

    #[test]
    fn test_internal_transaction_signature() {
        let key = KeyPair::generate();
        let peer = Peer::new(key.public_key_hex(), "addr", "joiner");
        let mut itx = InternalTransaction::new(TransactionKind::PeerAdd, peer);
        assert!(!itx.verify().unwrap());

        itx.sign(&key).unwrap();
        assert!(itx.verify().unwrap());

        let stranger = KeyPair::generate();
        assert!(itx.clone().sign(&stranger).is_err());

        itx.body.peer.net_addr = "elsewhere".to_string();
        assert!(!itx.verify().unwrap());
    }
}
