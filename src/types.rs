//! Core type definitions for the payment channel engine
//!
//! This module defines fundamental types used across multiple modules,
//! providing a common location for shared type definitions.

use std::fmt;

use bitcoin::hashes::Hash;
use bitcoin::Txid;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ============================================================================
// Fundamental Types
// ============================================================================

/// Type alias for 32-byte arrays used across cryptographic operations
pub type Bytes32 = [u8; 32];

/// Amounts are integral satoshis
pub type Sats = u64;

/// Absolute UNIX timestamp in seconds
pub type Timestamp = u64;

// ============================================================================
// Channel Domain
// ============================================================================

/// Domain separation tag for client-side channel identifiers
///
/// A client derives its channel identifier from the server identifier it
/// connects to, so reconnecting to the same server finds the same channel.
pub const CLIENT_CHANNEL_DOMAIN_TAG: &[u8] = b"PC_CLIENT_CH_v0";

/// Domain separation tag for server-side channel identifiers
pub const SERVER_CHANNEL_DOMAIN_TAG: &[u8] = b"PC_SERVER_CH_v0";

/// Smallest absolute lock time interpreted as a UNIX timestamp
pub const LOCKTIME_THRESHOLD: u64 = 500_000_000;

/// Stable identifier of a channel on one side of the protocol
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(Bytes32);

impl ChannelId {
    /// Wraps raw identifier bytes
    pub const fn from_bytes(bytes: Bytes32) -> Self { Self(bytes) }

    /// Returns the raw identifier bytes
    pub fn as_bytes(&self) -> &Bytes32 { &self.0 }

    /// Identifier a payer uses for its channel with `server_id`
    ///
    /// Computes hash("PC_CLIENT_CH_v0"||`server_id`).
    pub fn for_server(server_id: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(CLIENT_CHANNEL_DOMAIN_TAG);
        hasher.update(server_id.as_bytes());
        Self(hasher.finalize().into())
    }

    /// Identifier a payee uses for the channel funded by `contract_txid`
    ///
    /// Computes hash("PC_SERVER_CH_v0"||`contract_txid`).
    pub fn from_contract(contract_txid: &Txid) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(SERVER_CHANNEL_DOMAIN_TAG);
        hasher.update(contract_txid.to_byte_array());
        Self(hasher.finalize().into())
    }

    /// Lowercase hex rendering used for file names and logs
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Parses the lowercase hex rendering produced by [`ChannelId::to_hex`]
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 64 || !hex.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16).ok()?;
        }
        Some(Self(bytes))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.to_hex()) }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", &self.to_hex()[..16])
    }
}

/// Which side of the channel a state belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// The payer, who funds the contract
    Client,
    /// The payee, who receives increments
    Server,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_server() {
        let id = ChannelId::for_server("localhost");

        // Same input produces same output
        assert_eq!(id, ChannelId::for_server("localhost"));

        // Different servers produce different identifiers
        assert_ne!(id, ChannelId::for_server("example.org"));
    }

    #[test]
    fn test_from_contract() {
        let txid = Txid::from_byte_array([7u8; 32]);
        let id = ChannelId::from_contract(&txid);
        assert_eq!(id, ChannelId::from_contract(&txid));
        assert_ne!(id, ChannelId::from_contract(&Txid::from_byte_array([8u8; 32])));

        // Client and server domains never collide on the same bytes
        assert_ne!(*id.as_bytes(), *ChannelId::for_server("").as_bytes());
    }

    #[test]
    fn test_hex() {
        let id = ChannelId::from_bytes([0xab; 32]);
        let hex = id.to_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.starts_with("abab"));
        assert_eq!(ChannelId::from_hex(&hex), Some(id));
        assert_eq!(ChannelId::from_hex("zz"), None);
        assert_eq!(ChannelId::from_hex(&"g".repeat(64)), None);
    }
}
