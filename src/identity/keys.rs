//! Key generation and (de)serialization per algorithm.

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::SigningKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::EncodePublicKey as _;
use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;

use super::codec::KeyTypeTag;
use super::KeyError;

/// Smallest accepted RSA modulus, in bits.
pub const MIN_RSA_BITS: usize = 2048;
/// Largest accepted RSA modulus, in bits.
pub const MAX_RSA_BITS: usize = 8192;

/// Supported key algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    Ed25519,
    Ecdsa,
    Secp256k1,
    Rsa,
}

impl KeyType {
    pub(crate) fn tag(self) -> KeyTypeTag {
        match self {
            KeyType::Ed25519 => KeyTypeTag::Ed25519,
            KeyType::Ecdsa => KeyTypeTag::Ecdsa,
            KeyType::Secp256k1 => KeyTypeTag::Secp256k1,
            KeyType::Rsa => KeyTypeTag::Rsa,
        }
    }

    pub(crate) fn from_tag(tag: KeyTypeTag) -> Self {
        match tag {
            KeyTypeTag::Ed25519 => KeyType::Ed25519,
            KeyTypeTag::Ecdsa => KeyType::Ecdsa,
            KeyTypeTag::Secp256k1 => KeyType::Secp256k1,
            KeyTypeTag::Rsa => KeyType::Rsa,
        }
    }
}

impl FromStr for KeyType {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ed25519" => Ok(KeyType::Ed25519),
            "ecdsa" => Ok(KeyType::Ecdsa),
            "secp256k1" => Ok(KeyType::Secp256k1),
            "rsa" => Ok(KeyType::Rsa),
            _ => Err(KeyError::InvalidKeyType(s.to_string())),
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            KeyType::Ed25519 => "Ed25519",
            KeyType::Ecdsa => "ECDSA",
            KeyType::Secp256k1 => "Secp256k1",
            KeyType::Rsa => "RSA",
        })
    }
}

/// Private key material for one of the supported algorithms.
pub(crate) enum Keypair {
    Ed25519(SigningKey),
    Ecdsa(p256::SecretKey),
    Secp256k1(k256::SecretKey),
    Rsa(Box<RsaPrivateKey>),
}

impl Keypair {
    /// Generate fresh key material from the OS random source.
    ///
    /// `bits` only matters for RSA.
    pub(crate) fn generate(key_type: KeyType, bits: usize) -> Result<Self, KeyError> {
        let mut rng = OsRng;
        match key_type {
            KeyType::Ed25519 => Ok(Keypair::Ed25519(SigningKey::generate(&mut rng))),
            KeyType::Ecdsa => Ok(Keypair::Ecdsa(p256::SecretKey::random(&mut rng))),
            KeyType::Secp256k1 => Ok(Keypair::Secp256k1(k256::SecretKey::random(&mut rng))),
            KeyType::Rsa => {
                if !(MIN_RSA_BITS..=MAX_RSA_BITS).contains(&bits) {
                    return Err(KeyError::KeyGen(format!(
                        "RSA key length must be between {MIN_RSA_BITS} and {MAX_RSA_BITS} bits, got {bits}"
                    )));
                }
                let key = RsaPrivateKey::new(&mut rng, bits)
                    .map_err(|e| KeyError::KeyGen(e.to_string()))?;
                Ok(Keypair::Rsa(Box::new(key)))
            }
        }
    }

    /// Rebuild key material from its serialized form.
    pub(crate) fn from_bytes(key_type: KeyType, data: &[u8]) -> Result<Self, KeyError> {
        match key_type {
            KeyType::Ed25519 => {
                // Some encoders append the public key a second time.
                let data = if data.len() == 96 { &data[..64] } else { data };
                let bytes: &[u8; 64] = data.try_into().map_err(|_| {
                    KeyError::Unmarshal(format!("ed25519 key must be 64 bytes, got {}", data.len()))
                })?;
                SigningKey::from_keypair_bytes(bytes)
                    .map(Keypair::Ed25519)
                    .map_err(|e| KeyError::Unmarshal(format!("ed25519: {e}")))
            }
            KeyType::Ecdsa => p256::SecretKey::from_sec1_der(data)
                .map(Keypair::Ecdsa)
                .map_err(|e| KeyError::Unmarshal(format!("ecdsa: {e}"))),
            KeyType::Secp256k1 => k256::SecretKey::from_slice(data)
                .map(Keypair::Secp256k1)
                .map_err(|e| KeyError::Unmarshal(format!("secp256k1: {e}"))),
            KeyType::Rsa => {
                let key = RsaPrivateKey::from_pkcs1_der(data)
                    .map_err(|e| KeyError::Unmarshal(format!("rsa: {e}")))?;
                let bits = key.size() * 8;
                if !(MIN_RSA_BITS..=MAX_RSA_BITS).contains(&bits) {
                    return Err(KeyError::Unmarshal(format!("rsa: unsupported key length {bits}")));
                }
                Ok(Keypair::Rsa(Box::new(key)))
            }
        }
    }

    pub(crate) fn key_type(&self) -> KeyType {
        match self {
            Keypair::Ed25519(_) => KeyType::Ed25519,
            Keypair::Ecdsa(_) => KeyType::Ecdsa,
            Keypair::Secp256k1(_) => KeyType::Secp256k1,
            Keypair::Rsa(_) => KeyType::Rsa,
        }
    }

    /// Private key bytes in their wire layout.
    pub(crate) fn private_bytes(&self) -> Result<Vec<u8>, KeyError> {
        match self {
            Keypair::Ed25519(k) => Ok(k.to_keypair_bytes().to_vec()),
            Keypair::Ecdsa(k) => k
                .to_sec1_der()
                .map(|der| der.to_vec())
                .map_err(|e| KeyError::KeyGen(format!("ecdsa: {e}"))),
            Keypair::Secp256k1(k) => Ok(k.to_bytes().to_vec()),
            Keypair::Rsa(k) => k
                .to_pkcs1_der()
                .map(|der| der.as_bytes().to_vec())
                .map_err(|e| KeyError::KeyGen(format!("rsa: {e}"))),
        }
    }

    /// Public key bytes in their wire layout.
    pub(crate) fn public_bytes(&self) -> Result<Vec<u8>, KeyError> {
        match self {
            Keypair::Ed25519(k) => Ok(k.verifying_key().to_bytes().to_vec()),
            Keypair::Ecdsa(k) => k
                .public_key()
                .to_public_key_der()
                .map(|der| der.as_bytes().to_vec())
                .map_err(|e| KeyError::KeyGen(format!("ecdsa: {e}"))),
            Keypair::Secp256k1(k) => Ok(k.public_key().to_encoded_point(true).as_bytes().to_vec()),
            Keypair::Rsa(k) => rsa::pkcs8::EncodePublicKey::to_public_key_der(&k.to_public_key())
                .map(|der| der.as_bytes().to_vec())
                .map_err(|e| KeyError::KeyGen(format!("rsa: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_type_parse_is_case_insensitive() {
        assert_eq!("ED25519".parse::<KeyType>().unwrap(), KeyType::Ed25519);
        assert_eq!("ecdsa".parse::<KeyType>().unwrap(), KeyType::Ecdsa);
        assert_eq!("Secp256k1".parse::<KeyType>().unwrap(), KeyType::Secp256k1);
        assert_eq!("rsa".parse::<KeyType>().unwrap(), KeyType::Rsa);
        assert!(matches!("dsa".parse::<KeyType>(), Err(KeyError::InvalidKeyType(_))));
    }

    #[test]
    fn test_public_key_sizes() {
        let ed = Keypair::generate(KeyType::Ed25519, 0).unwrap();
        assert_eq!(ed.public_bytes().unwrap().len(), 32);
        assert_eq!(ed.private_bytes().unwrap().len(), 64);

        let k1 = Keypair::generate(KeyType::Secp256k1, 0).unwrap();
        assert_eq!(k1.public_bytes().unwrap().len(), 33);
        assert_eq!(k1.private_bytes().unwrap().len(), 32);
    }

    #[test]
    fn test_rsa_bits_out_of_range() {
        assert!(matches!(
            Keypair::generate(KeyType::Rsa, 1024),
            Err(KeyError::KeyGen(_))
        ));
        assert!(matches!(
            Keypair::generate(KeyType::Rsa, 16384),
            Err(KeyError::KeyGen(_))
        ));
    }

    #[test]
    fn test_wrong_length_ed25519_rejected() {
        assert!(matches!(
            Keypair::from_bytes(KeyType::Ed25519, &[0u8; 10]),
            Err(KeyError::Unmarshal(_))
        ));
    }
}
