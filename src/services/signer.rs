//! Signing service
//!
//! The engine never holds private keys itself. It asks a [`Signer`] to sign
//! instrument sighashes with a named public key.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use bitcoin::secp256k1::{ecdsa::Signature, All, Message, Secp256k1, SecretKey};
use bitcoin::PublicKey;

use crate::errors::{Result, ServiceError};

/// Signs 32-byte digests with keys it controls
#[async_trait]
pub trait Signer: Send + Sync {
    /// Signs `digest` with the secret key behind `key`
    ///
    /// # Errors
    /// * `ServiceError::KeyUnavailable` - If the signer does not hold `key`
    /// * `ServiceError::CryptoError` - If signing fails
    async fn sign(&self, digest: [u8; 32], key: &PublicKey) -> Result<Signature>;
}

/// Signer backed by an in-process key map
pub struct InMemorySigner {
    keys: Mutex<HashMap<PublicKey, SecretKey>>,
    secp: Secp256k1<All>,
}

impl InMemorySigner {
    /// Creates a signer holding no keys
    pub fn new() -> Self { Self { keys: Mutex::new(HashMap::new()), secp: Secp256k1::new() } }

    /// Adds `secret` and returns its public key
    pub fn add_key(&self, secret: SecretKey) -> PublicKey {
        let key = PublicKey::new(secret.public_key(&self.secp));
        self.keys.lock().unwrap_or_else(PoisonError::into_inner).insert(key, secret);
        key
    }

    /// Generates a fresh key and returns its public key
    pub fn generate_key(&self) -> PublicKey {
        let secret = SecretKey::new(&mut rand::thread_rng());
        self.add_key(secret)
    }

    /// Whether `key` is held by this signer
    pub fn has_key(&self, key: &PublicKey) -> bool {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner).contains_key(key)
    }
}

impl Default for InMemorySigner {
    fn default() -> Self { Self::new() }
}

#[async_trait]
impl Signer for InMemorySigner {
    async fn sign(&self, digest: [u8; 32], key: &PublicKey) -> Result<Signature> {
        let secret = self
            .keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
            .ok_or_else(|| ServiceError::KeyUnavailable(key.to_string()))?;
        let message = Message::from_digest(digest);
        Ok(self.secp.sign_ecdsa(&message, &secret))
    }
}
