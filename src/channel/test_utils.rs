//! Shared test utilities for channel module tests
//!
//! This module provides common helper functions used across the crate's tests.

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{ecdsa::Signature, Message, Secp256k1, SecretKey};
use bitcoin::{OutPoint, PublicKey, Txid};

use crate::channel::contract::ChannelContract;
use crate::protocol::version::ProtocolVersion;
use crate::types::Sats;

/// Expiry used by test contracts (2023-11-14)
pub const TEST_EXPIRY: u64 = 1_700_000_000;

/// Deterministically derive a secret key from a single byte (tests only)
pub fn deterministic_secret(byte: u8) -> SecretKey {
    SecretKey::from_slice(&[byte; 32]).expect("32-byte array should always be a valid SecretKey")
}

/// Secret key of the test payer
pub fn payer_secret() -> SecretKey { deterministic_secret(1) }

/// Secret key of the test payee
pub fn payee_secret() -> SecretKey { deterministic_secret(2) }

/// Public key for `secret`
pub fn public_key(secret: &SecretKey) -> PublicKey {
    let secp = Secp256k1::new();
    PublicKey::new(secret.public_key(&secp))
}

/// Helper function to generate test payer and payee public keys
pub fn test_keys() -> (PublicKey, PublicKey) {
    (public_key(&payer_secret()), public_key(&payee_secret()))
}

/// A contract between the test keys, funded at a fixed outpoint
pub fn funded_contract(version: ProtocolVersion, total_value: Sats) -> ChannelContract {
    let (payer, payee) = test_keys();
    ChannelContract::new(total_value, TEST_EXPIRY, payer, payee, version)
        .expect("test contract terms are valid")
        .with_funding(OutPoint { txid: Txid::from_byte_array([9u8; 32]), vout: 0 })
}

/// Signs a 32-byte digest with `secret`
pub fn sign_digest(secret: &SecretKey, digest: [u8; 32]) -> Signature {
    let secp = Secp256k1::new();
    secp.sign_ecdsa(&Message::from_digest(digest), secret)
}
