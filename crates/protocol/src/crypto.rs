//! Signing capability and hashing helpers.
//!
//! The engine only needs two primitives from the outside world: something that
//! can sign a byte string for the local validator, and a way to check a
//! signature against a peer's public key. Keys and signatures travel as hex
//! strings; hashes are Blake3.

use ed25519_dalek::{Signature, Signer as DalekSigner, SigningKey, Verifier, VerifyingKey};

use crate::errors::ProtocolError;
use crate::PeerId;

/// Capability to sign on behalf of the local validator.
pub trait Signer: Send + Sync {
    /// Hex-encoded public key matching the signatures produced by [`Signer::sign`].
    fn public_key_hex(&self) -> String;

    /// Sign `message`, returning a hex-encoded signature.
    fn sign(&self, message: &[u8]) -> String;
}

/// Ed25519 key pair of a validator.
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a fresh key pair from the OS random source.
    pub fn generate() -> Self {
        let seed: [u8; 32] = rand::random();
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    /// Restore a key pair from its hex-encoded 32-byte secret.
    pub fn from_hex(secret_hex: &str) -> Result<Self, ProtocolError> {
        let bytes = hex::decode(secret_hex.trim())?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ProtocolError::InvalidFormat {
                reason: format!("private key must be 32 bytes, got {}", bytes.len()),
            })?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&seed),
        })
    }

    /// Hex-encoded secret, suitable for a key file.
    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    /// Peer id derived from the public key.
    pub fn peer_id(&self) -> PeerId {
        peer_id_from_bytes(self.signing_key.verifying_key().as_bytes())
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

impl Signer for KeyPair {
    fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().as_bytes())
    }

    fn sign(&self, message: &[u8]) -> String {
        hex::encode(self.signing_key.sign(message).to_bytes())
    }
}

/// Verify a hex signature over `message` with a hex public key.
///
/// Malformed keys or signatures are reported as errors; a well-formed signature
/// that does not match yields `Ok(false)`.
pub fn verify(public_key_hex: &str, message: &[u8], signature_hex: &str) -> Result<bool, ProtocolError> {
    let key_bytes = hex::decode(public_key_hex)?;
    let key_array: [u8; 32] =
        key_bytes
            .as_slice()
            .try_into()
            .map_err(|_| ProtocolError::InvalidFormat {
                reason: "public key must be 32 bytes".to_string(),
            })?;
    let verifying_key =
        VerifyingKey::from_bytes(&key_array).map_err(|e| ProtocolError::CryptographicError {
            reason: format!("invalid public key: {}", e),
        })?;

    let signature_bytes = hex::decode(signature_hex)?;
    let signature =
        Signature::from_slice(&signature_bytes).map_err(|_| ProtocolError::InvalidFormat {
            reason: "Invalid signature format".to_string(),
        })?;

    Ok(verifying_key.verify(message, &signature).is_ok())
}

/// Peer id of a hex-encoded public key.
pub fn peer_id_from_public_key(public_key_hex: &str) -> Result<PeerId, ProtocolError> {
    let bytes = hex::decode(public_key_hex)?;
    Ok(peer_id_from_bytes(&bytes))
}

/// Peer ids are the first four bytes of the Blake3 hash of the public key.
pub fn peer_id_from_bytes(public_key: &[u8]) -> PeerId {
    let digest = blake3::hash(public_key);
    let bytes = digest.as_bytes();
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Domain-separated Blake3 hash of a canonical payload.
pub fn hash_with_domain(domain: &str, payload: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key(domain);
    hasher.update(payload);
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let key = KeyPair::generate();
        let signature = key.sign(b"hello");

        assert!(verify(&key.public_key_hex(), b"hello", &signature).unwrap());
        assert!(!verify(&key.public_key_hex(), b"goodbye", &signature).unwrap());
    }

    #[test]
    fn test_verify_rejects_garbage() {
        let key = KeyPair::generate();
        assert!(verify(&key.public_key_hex(), b"hello", "zz").is_err());
        assert!(verify("abcd", b"hello", &key.sign(b"hello")).is_err());
    }

    #[test]
    fn test_secret_round_trip() {
        let key = KeyPair::generate();
        let restored = KeyPair::from_hex(&key.secret_hex()).unwrap();
        assert_eq!(key.public_key_hex(), restored.public_key_hex());
        assert_eq!(key.peer_id(), restored.peer_id());
        assert_eq!(
            peer_id_from_public_key(&key.public_key_hex()).unwrap(),
            key.peer_id()
        );
    }
}
