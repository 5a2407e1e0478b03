//! Peer identifiers.
//!
//! A PeerId is the multihash of a public key's protobuf encoding: the
//! identity hash when the encoding is at most 42 bytes, sha2-256 otherwise.
//! It is rendered as base58btc.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

const IDENTITY_CODE: u8 = 0x00;
const SHA2_256_CODE: u8 = 0x12;
const SHA2_256_LEN: u8 = 32;
const MAX_INLINE_KEY_LENGTH: usize = 42;

/// Error returned when a string is not a valid PeerId.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerIdError {
    #[error("invalid base58: {0}")]
    Base58(String),
    #[error("invalid multihash: {0}")]
    Multihash(&'static str),
}

/// Identifier of a peer, derived from its public key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId {
    multihash: Vec<u8>,
}

impl PeerId {
    /// Derive a PeerId from a protobuf-encoded public key.
    pub fn from_public_key_bytes(encoded: &[u8]) -> Self {
        let mut multihash = Vec::with_capacity(34.max(encoded.len() + 2));
        if encoded.len() <= MAX_INLINE_KEY_LENGTH {
            multihash.push(IDENTITY_CODE);
            multihash.push(encoded.len() as u8);
            multihash.extend_from_slice(encoded);
        } else {
            multihash.push(SHA2_256_CODE);
            multihash.push(SHA2_256_LEN);
            multihash.extend_from_slice(&Sha256::digest(encoded));
        }
        Self { multihash }
    }

    /// Parse raw multihash bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PeerIdError> {
        let [code, len, digest @ ..] = bytes else {
            return Err(PeerIdError::Multihash("too short"));
        };
        if *len as usize != digest.len() {
            return Err(PeerIdError::Multihash("length mismatch"));
        }
        match *code {
            IDENTITY_CODE if digest.len() <= MAX_INLINE_KEY_LENGTH => {}
            IDENTITY_CODE => return Err(PeerIdError::Multihash("inline key too long")),
            SHA2_256_CODE if *len == SHA2_256_LEN => {}
            SHA2_256_CODE => return Err(PeerIdError::Multihash("bad sha2-256 length")),
            _ => return Err(PeerIdError::Multihash("unsupported hash code")),
        }
        Ok(Self {
            multihash: bytes.to_vec(),
        })
    }

    /// Raw multihash bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.multihash
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(&self.multihash).into_string()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PeerId").field(&self.to_base58()).finish()
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| PeerIdError::Base58(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base58())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_key_uses_identity_hash() {
        let id = PeerId::from_public_key_bytes(&[1u8; 36]);
        assert_eq!(id.as_bytes()[0], IDENTITY_CODE);
        assert_eq!(id.as_bytes()[1], 36);
        assert_eq!(id.as_bytes().len(), 38);
    }

    #[test]
    fn test_long_key_uses_sha256() {
        let id = PeerId::from_public_key_bytes(&[1u8; 300]);
        assert_eq!(&id.as_bytes()[..2], &[SHA2_256_CODE, SHA2_256_LEN]);
        assert_eq!(id.as_bytes().len(), 34);
    }

    #[test]
    fn test_string_form_parses_back() {
        let id = PeerId::from_public_key_bytes(&[7u8; 36]);
        let parsed: PeerId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!("0OIl".parse::<PeerId>(), Err(PeerIdError::Base58(_))));
        let bad = bs58::encode([0x12, 0x05, 1, 2, 3, 4, 5]).into_string();
        assert!(matches!(bad.parse::<PeerId>(), Err(PeerIdError::Multihash(_))));
        let truncated = bs58::encode([0x00, 0x10, 1]).into_string();
        assert!(truncated.parse::<PeerId>().is_err());
    }
}
