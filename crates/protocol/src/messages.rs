//! Request/response messages exchanged between nodes.
//!
//! Every message is a plain serde structure; any reliable point-to-point
//! transport can carry them.

use serde::{Deserialize, Serialize};

use crate::block::{Block, Frame};
use crate::dag::KnownIndexes;
use crate::events::{InternalTransaction, WireEvent};
use crate::peers::Peer;
use crate::PeerId;

/// Pull request: "here is what I know, send me the rest".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncRequest {
    pub from_id: PeerId,
    pub known: KnownIndexes,
}

/// Events the requester is missing, in topological order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncResponse {
    pub from_id: PeerId,
    /// The response was truncated; the requester should ask again
    pub sync_limit: bool,
    pub events: Vec<WireEvent>,
    /// The responder's own known map
    pub known: KnownIndexes,
}

/// Push of events the sender believes the receiver lacks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EagerSyncRequest {
    pub from_id: PeerId,
    pub events: Vec<WireEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EagerSyncResponse {
    pub from_id: PeerId,
    pub success: bool,
}

/// Request for a snapshot to restart from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FastForwardRequest {
    pub from_id: PeerId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FastForwardResponse {
    pub from_id: PeerId,
    pub block: Block,
    pub frame: Frame,
    /// Opaque application snapshot taken at `block`
    #[serde(with = "crate::encoding::hex_bytes")]
    pub snapshot: Vec<u8>,
}

/// Membership proposal submitted to a validator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JoinRequest {
    pub internal_transaction: InternalTransaction,
}

/// Local acknowledgement of a [`JoinRequest`], not a consensus decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JoinResponse {
    pub from_id: PeerId,
    /// The proposal was well formed and queued
    pub accepted: bool,
    /// The responder's current round estimate
    pub accepted_round: i64,
    /// The responder's current peer set
    pub peers: Vec<Peer>,
}

/// Any request a node serves.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Command {
    Sync(SyncRequest),
    EagerSync(EagerSyncRequest),
    FastForward(FastForwardRequest),
    Join(JoinRequest),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Sync(_) => "sync",
            Command::EagerSync(_) => "eager_sync",
            Command::FastForward(_) => "fast_forward",
            Command::Join(_) => "join",
        }
    }
}

/// Response matching a [`Command`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum CommandResponse {
    Sync(SyncResponse),
    EagerSync(EagerSyncResponse),
    FastForward(Box<FastForwardResponse>),
    Join(JoinResponse),
    /// The responder could not serve the request
    Error(String),
}
