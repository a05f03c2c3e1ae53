//! Store and consensus errors

use hashweave_protocol::{PeerId, ProtocolError};
use thiserror::Error;

/// Storage-related errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {source}")]
    DatabaseError { source: sled::Error },

    #[error("Serialization error: {source}")]
    SerializationError { source: serde_json::Error },

    #[error("Key not found: {key}")]
    KeyNotFound { key: String },

    #[error("Corrupt record: {reason}")]
    Corrupt { reason: String },
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::DatabaseError { source: err }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::SerializationError { source: err }
    }
}

/// Errors raised while ingesting events or advancing consensus.
#[derive(Error, Debug)]
pub enum HashgraphError {
    /// Bad signature, missing or mismatched parent, non-consecutive index
    #[error("Invalid event: {reason}")]
    InvalidEvent { reason: String },

    /// A creator signed two events with the same index
    #[error("Equivocation detected: creator {creator} index {index}")]
    EquivocationDetected { creator: PeerId, index: i64 },

    /// A wire event references a parent this node does not have yet
    #[error("Out of order event: {reason}")]
    OutOfOrderEvent { reason: String },

    /// A fast-forward block or frame failed validation
    #[error("Snapshot mismatch: {reason}")]
    SnapshotMismatch { reason: String },

    #[error("Store error: {source}")]
    Store {
        #[from]
        source: StoreError,
    },

    #[error("Protocol error: {source}")]
    Protocol {
        #[from]
        source: ProtocolError,
    },
}

impl HashgraphError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        HashgraphError::InvalidEvent {
            reason: reason.into(),
        }
    }

    /// Errors that only concern the offending event and leave the node healthy.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, HashgraphError::Store { .. })
    }
}
