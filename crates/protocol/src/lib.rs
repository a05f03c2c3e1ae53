//! Hashweave protocol types
//!
//! This crate defines the types shared by the consensus core and the node:
//! signed events and their wire form, validator peer sets, blocks, frames and
//! the request/response messages of the sync, fast-forward and join
//! protocols.

pub mod block;
pub mod crypto;
pub mod dag;
pub mod encoding;
pub mod errors;
pub mod events;
pub mod messages;
pub mod peers;

pub use block::{Block, BlockBody, Frame};
pub use crypto::{KeyPair, Signer};
pub use dag::{DagStats, KnownIndexes};
pub use errors::ProtocolError;
pub use events::{
    BlockSignature, Event, EventBody, EventHash, EventMeta, InternalTransaction,
    InternalTransactionBody, TransactionKind, WireBody, WireEvent,
};
pub use messages::{
    Command, CommandResponse, EagerSyncRequest, EagerSyncResponse, FastForwardRequest,
    FastForwardResponse, JoinRequest, JoinResponse, SyncRequest, SyncResponse,
};
pub use peers::{Peer, PeerSet};

/// Validator identifier derived from its public key.
pub type PeerId = u32;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Version of the Hashweave protocol
pub const PROTOCOL_VERSION: &str = "0.1.0";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_version() {
        assert!(!PROTOCOL_VERSION.is_empty());
    }
}
