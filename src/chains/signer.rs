use async_trait::async_trait;
use ed25519_dalek::{Signer as _, SigningKey};

use super::Signer;
use crate::types::RelayError;

/// Relay account key held in memory
pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    /// Parse a 32-byte seed given as hex, with or without `0x`.
    pub fn from_hex_seed(seed: &str) -> Result<Self, RelayError> {
        let bytes = hex::decode(seed.trim().trim_start_matches("0x"))
            .map_err(|e| RelayError::Config(format!("Invalid signing key: {}", e)))?;
        let seed: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            RelayError::Config(format!(
                "Invalid signing key length: expected 32 bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self::new(SigningKey::from_bytes(&seed)))
    }
}

#[async_trait]
impl Signer for Ed25519Signer {
    fn public_key(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }

    async fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, RelayError> {
        let signature = self
            .key
            .try_sign(payload)
            .map_err(|e| RelayError::SigningFailure(e.to_string()))?;
        Ok(signature.to_bytes().to_vec())
    }
}
