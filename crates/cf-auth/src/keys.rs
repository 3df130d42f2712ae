//! Ed25519 signing keys

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::error::CertError;

/// Length of an Ed25519 public key or seed
pub const KEY_LEN: usize = 32;

/// Ed25519 key pair
#[derive(Clone)]
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Rebuild from a 32-byte seed
    pub fn from_seed(seed: &[u8]) -> Result<Self, CertError> {
        let seed: [u8; KEY_LEN] = seed
            .try_into()
            .map_err(|_| CertError::Malformed(format!("seed must be {} bytes", KEY_LEN)))?;
        Ok(Self {
            signing: SigningKey::from_bytes(&seed),
        })
    }

    pub fn from_hex(seed: &str) -> Result<Self, CertError> {
        let bytes = hex::decode(seed).map_err(|e| CertError::Malformed(e.to_string()))?;
        Self::from_seed(&bytes)
    }

    pub fn seed_hex(&self) -> String {
        hex::encode(self.signing.to_bytes())
    }

    pub fn public_key(&self) -> [u8; KEY_LEN] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn key_id(&self) -> String {
        key_id(&self.public_key())
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("key_id", &self.key_id())
            .finish()
    }
}

/// Check `signature` over `message` against a raw public key
pub fn verify_signature(public_key: &[u8; KEY_LEN], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify(message, &signature).is_ok()
}

/// Short stable identifier of a public key
pub fn key_id(public_key: &[u8; KEY_LEN]) -> String {
    hex::encode(&Sha256::digest(public_key)[..8])
}

/// Decode a hex public key
pub fn decode_public_key(hex_key: &str) -> Result<[u8; KEY_LEN], CertError> {
    let bytes = hex::decode(hex_key).map_err(|e| CertError::Malformed(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| CertError::Malformed("public key must be 32 bytes".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let pair = KeyPair::generate();
        let signature = pair.sign(b"message");

        assert!(verify_signature(&pair.public_key(), b"message", &signature));
        assert!(!verify_signature(&pair.public_key(), b"other", &signature));
        assert!(!verify_signature(&KeyPair::generate().public_key(), b"message", &signature));
        assert!(!verify_signature(&pair.public_key(), b"message", &signature[..10]));
    }

    #[test]
    fn test_seed_hex_restores_same_key() {
        let pair = KeyPair::generate();
        let restored = KeyPair::from_hex(&pair.seed_hex()).unwrap();
        assert_eq!(pair.public_key(), restored.public_key());
        assert_eq!(pair.key_id().len(), 16);
    }

    #[test]
    fn test_bad_seed_length() {
        assert!(KeyPair::from_seed(&[1, 2, 3]).is_err());
        assert!(decode_public_key("abcd").is_err());
    }
}
