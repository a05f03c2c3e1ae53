//! Protocol errors module

use thiserror::Error;

/// Protocol-level errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serialization error: {source}")]
    SerializationError { source: serde_json::Error },

    #[error("Invalid format: {reason}")]
    InvalidFormat { reason: String },

    #[error("Validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Cryptographic error: {reason}")]
    CryptographicError { reason: String },

    #[error("Unknown peer: {peer_id}")]
    UnknownPeer { peer_id: crate::PeerId },
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::SerializationError { source: err }
    }
}

impl From<hex::FromHexError> for ProtocolError {
    fn from(err: hex::FromHexError) -> Self {
        ProtocolError::InvalidFormat {
            reason: format!("invalid hex: {}", err),
        }
    }
}
