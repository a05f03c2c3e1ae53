//! Node-level errors

use hashweave_hashgraph::HashgraphError;
use hashweave_protocol::{PeerId, ProtocolError};
use thiserror::Error;

/// Failures while moving requests between nodes
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Peer {addr} is unreachable")]
    Unreachable { addr: String },

    #[error("Request to {addr} timed out")]
    Timeout { addr: String },

    #[error("Transport is closed")]
    Closed,

    #[error("Frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Codec error: {source}")]
    Codec {
        #[from]
        source: serde_json::Error,
    },
}

/// Failures reported by the application behind the proxy
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Commit of block {index} failed: {reason}")]
    Commit { index: u64, reason: String },

    #[error("No snapshot for block {index}")]
    SnapshotNotFound { index: u64 },

    #[error("Restore failed: {reason}")]
    Restore { reason: String },

    #[error("Submit channel is full or closed")]
    SubmitUnavailable,
}

/// Failures of the sync, fast-forward and membership protocols
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Transport error: {source}")]
    Transport {
        #[from]
        source: TransportError,
    },

    #[error("Consensus error: {source}")]
    Consensus {
        #[from]
        source: HashgraphError,
    },

    #[error("Protocol error: {source}")]
    Protocol {
        #[from]
        source: ProtocolError,
    },

    #[error("Application error: {source}")]
    Proxy {
        #[from]
        source: ProxyError,
    },

    #[error("Unexpected response to {command} from {peer}")]
    UnexpectedResponse { command: String, peer: PeerId },

    #[error("Peer {peer} refused the request: {reason}")]
    Refused { peer: PeerId, reason: String },

    #[error("Membership request rejected: {reason}")]
    MembershipRejected { reason: String },

    #[error("No peer to talk to")]
    NoPeers,
}

impl SyncError {
    /// The responder sent events whose parents we lack; pulling again fixes it.
    pub fn is_out_of_order(&self) -> bool {
        matches!(
            self,
            SyncError::Consensus {
                source: HashgraphError::OutOfOrderEvent { .. }
            }
        )
    }
}
