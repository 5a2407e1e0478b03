//! Protobuf envelopes for serialized keys.
//!
//! Layout is the libp2p `crypto.proto` one: a required key type and the
//! type-specific key bytes.

use prost::Message;

use super::KeyError;

/// Key algorithm tag as carried on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum KeyTypeTag {
    Rsa = 0,
    Ed25519 = 1,
    Secp256k1 = 2,
    Ecdsa = 3,
}

/// Serialized private key.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PrivateKeyEnvelope {
    #[prost(enumeration = "KeyTypeTag", required, tag = "1")]
    pub key_type: i32,
    #[prost(bytes = "vec", required, tag = "2")]
    pub data: Vec<u8>,
}

/// Serialized public key. Its encoding is what a PeerId hashes.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PublicKeyEnvelope {
    #[prost(enumeration = "KeyTypeTag", required, tag = "1")]
    pub key_type: i32,
    #[prost(bytes = "vec", required, tag = "2")]
    pub data: Vec<u8>,
}

impl PrivateKeyEnvelope {
    pub fn new(tag: KeyTypeTag, data: Vec<u8>) -> Self {
        Self {
            key_type: tag as i32,
            data,
        }
    }

    /// Decode and check the type tag.
    pub fn decode_checked(bytes: &[u8]) -> Result<(KeyTypeTag, Vec<u8>), KeyError> {
        let envelope = Self::decode(bytes)
            .map_err(|e| KeyError::Unmarshal(format!("private key envelope: {e}")))?;
        let tag = KeyTypeTag::try_from(envelope.key_type)
            .map_err(|_| KeyError::Unmarshal(format!("unknown key type tag {}", envelope.key_type)))?;
        if envelope.data.is_empty() {
            return Err(KeyError::Unmarshal("empty key data".to_string()));
        }
        Ok((tag, envelope.data))
    }
}

impl PublicKeyEnvelope {
    pub fn new(tag: KeyTypeTag, data: Vec<u8>) -> Self {
        Self {
            key_type: tag as i32,
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_layout() {
        let env = PrivateKeyEnvelope::new(KeyTypeTag::Ed25519, vec![0xAA, 0xBB]);
        // field 1 varint = 1, field 2 bytes len 2
        assert_eq!(env.encode_to_vec(), vec![0x08, 0x01, 0x12, 0x02, 0xAA, 0xBB]);
    }

    #[test]
    fn test_rsa_tag_is_encoded_even_though_zero() {
        let env = PublicKeyEnvelope::new(KeyTypeTag::Rsa, vec![0x01]);
        assert_eq!(env.encode_to_vec(), vec![0x08, 0x00, 0x12, 0x01, 0x01]);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let bytes = [0x08, 0x09, 0x12, 0x01, 0x00];
        assert!(matches!(
            PrivateKeyEnvelope::decode_checked(&bytes),
            Err(KeyError::Unmarshal(_))
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(PrivateKeyEnvelope::decode_checked(&[0xFF, 0xFF, 0xFF]).is_err());
    }
}
