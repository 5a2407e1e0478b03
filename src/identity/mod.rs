//! Node identity: key generation, loading and PeerId derivation.
//!
//! # Data Flow
//! ```text
//! generate(type, bits) ─┐
//!                       ├→ Keypair → PublicKeyEnvelope → PeerId
//! load(base64) ─────────┘
//!     base64 → PrivateKeyEnvelope{type, data} → Keypair
//!
//! export(identity) → base64(PrivateKeyEnvelope)
//! ```
//!
//! # Design Decisions
//! - One Identity per process, shared as `Arc<Identity>`
//! - Key material comes from the OS random source only
//! - Encodings are computed once at construction so `export` cannot fail
//! - Loading never returns a partially valid identity

pub mod codec;
pub mod keys;
pub mod peer_id;

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use prost::Message as _;

use codec::{PrivateKeyEnvelope, PublicKeyEnvelope};
use keys::Keypair;

pub use keys::{KeyType, MAX_RSA_BITS, MIN_RSA_BITS};
pub use peer_id::{PeerId, PeerIdError};

/// Default RSA key length, in bits.
pub const DEFAULT_RSA_BITS: usize = 2048;

/// Error type for identity operations.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("unknown key type '{0}': only Ed25519, ECDSA, Secp256k1, RSA supported")]
    InvalidKeyType(String),
    #[error("key generation failed: {0}")]
    KeyGen(String),
    #[error("key is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("unmarshal private key: {0}")]
    Unmarshal(String),
}

/// The node's key pair and the PeerId derived from it.
pub struct Identity {
    keypair: Keypair,
    public_key: Vec<u8>,
    peer_id: PeerId,
    encoded: String,
}

impl Identity {
    /// Generate a fresh identity.
    pub fn generate(key_type: KeyType, bits: usize) -> Result<Self, KeyError> {
        let keypair = Keypair::generate(key_type, bits)?;
        Self::from_keypair(keypair)
    }

    /// Load an identity from the base64 text produced by [`Identity::export`].
    pub fn load(encoded: &str) -> Result<Self, KeyError> {
        let raw = STANDARD.decode(encoded.trim())?;
        let (tag, data) = PrivateKeyEnvelope::decode_checked(&raw)?;
        let keypair = Keypair::from_bytes(KeyType::from_tag(tag), &data)?;
        Self::from_keypair(keypair)
    }

    fn from_keypair(keypair: Keypair) -> Result<Self, KeyError> {
        let tag = keypair.key_type().tag();
        let public_key = PublicKeyEnvelope::new(tag, keypair.public_bytes()?).encode_to_vec();
        let private_key = PrivateKeyEnvelope::new(tag, keypair.private_bytes()?).encode_to_vec();
        let peer_id = PeerId::from_public_key_bytes(&public_key);
        Ok(Self {
            keypair,
            public_key,
            peer_id,
            encoded: STANDARD.encode(private_key),
        })
    }

    /// Base64 text form of the private key.
    pub fn export(&self) -> String {
        self.encoded.clone()
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn key_type(&self) -> KeyType {
        self.keypair.key_type()
    }

    /// Protobuf encoding of the public key.
    pub fn public_key_bytes(&self) -> &[u8] {
        &self.public_key
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("key_type", &self.key_type())
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

/// Generate a fresh identity of the given type.
pub fn generate(key_type: KeyType, bits: usize) -> Result<Identity, KeyError> {
    Identity::generate(key_type, bits)
}

/// Load an identity from its base64 text form.
pub fn load(encoded: &str) -> Result<Identity, KeyError> {
    Identity::load(encoded)
}

/// Export an identity to its base64 text form.
pub fn export(identity: &Identity) -> String {
    identity.export()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(key_type: KeyType, bits: usize) {
        let original = generate(key_type, bits).unwrap();
        let text = export(&original);
        let loaded = load(&text).unwrap();
        assert_eq!(loaded.key_type(), key_type);
        assert_eq!(loaded.peer_id(), original.peer_id());
        assert_eq!(export(&loaded), text);
    }

    #[test]
    fn test_round_trip_ed25519() {
        round_trip(KeyType::Ed25519, 0);
    }

    #[test]
    fn test_round_trip_ecdsa() {
        round_trip(KeyType::Ecdsa, 0);
    }

    #[test]
    fn test_round_trip_secp256k1() {
        round_trip(KeyType::Secp256k1, 0);
    }

    #[test]
    fn test_round_trip_rsa() {
        round_trip(KeyType::Rsa, DEFAULT_RSA_BITS);
    }

    #[test]
    fn test_ed25519_peer_id_is_inline() {
        let id = generate(KeyType::Ed25519, 0).unwrap();
        assert!(id.peer_id().to_string().starts_with("12D3KooW"));
    }

    #[test]
    fn test_fresh_identities_differ() {
        let a = generate(KeyType::Ed25519, 0).unwrap();
        let b = generate(KeyType::Ed25519, 0).unwrap();
        assert_ne!(a.peer_id(), b.peer_id());
    }

    #[test]
    fn test_load_rejects_bad_base64() {
        assert!(matches!(load("not base64!!"), Err(KeyError::Decode(_))));
    }

    #[test]
    fn test_load_rejects_malformed_key() {
        let bogus = STANDARD.encode([0x08, 0x01, 0x12, 0x03, 1, 2, 3]);
        assert!(matches!(load(&bogus), Err(KeyError::Unmarshal(_))));
        assert!(matches!(load(""), Err(KeyError::Unmarshal(_))));
    }

    #[test]
    fn test_load_ignores_surrounding_whitespace() {
        let id = generate(KeyType::Secp256k1, 0).unwrap();
        let loaded = load(&format!("  {}\n", id.export())).unwrap();
        assert_eq!(loaded.peer_id(), id.peer_id());
    }
}
