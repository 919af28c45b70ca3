//! Protocol version negotiation
//!
//! A version is treated as an opaque capability set. The state machines only
//! ask what a version implies; they never compare version numbers directly.

use serde::{Deserialize, Serialize};

/// Negotiated payment channel protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// 2-of-2 multisig contract with a co-signed, time-locked refund
    V1,
    /// Contract script with a payer-only refund branch after expiry
    V2,
}

/// How the contract output may be spent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContractKind {
    /// Every spend needs both signatures
    Multisig,
    /// Cooperative spends need both signatures, the payer alone may spend after expiry
    TimeLocked,
}

impl ProtocolVersion {
    /// Highest version this implementation speaks
    pub const LATEST: Self = Self::V2;

    /// All supported versions, lowest first
    pub const ALL: [Self; 2] = [Self::V1, Self::V2];

    /// Wire number of this version
    pub fn number(self) -> u32 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }

    /// Parses a wire number
    pub fn from_number(number: u32) -> Option<Self> {
        match number {
            1 => Some(Self::V1),
            2 => Some(Self::V2),
            _ => None,
        }
    }

    /// Picks the highest version supported by both peers
    ///
    /// Each side advertises the highest version it speaks and is assumed to
    /// speak every lower one. Returns `None` when either side offers
    /// nothing this implementation knows.
    pub fn negotiate(client_max: u32, server_max: u32) -> Option<Self> {
        let common = client_max.min(server_max).min(Self::LATEST.number());
        Self::ALL.iter().rev().copied().find(|v| v.number() <= common)
    }

    /// Shape of the contract output
    pub fn contract_kind(self) -> ContractKind {
        match self {
            Self::V1 => ContractKind::Multisig,
            Self::V2 => ContractKind::TimeLocked,
        }
    }

    /// The payee co-signs the initial refund before the contract is broadcast
    pub fn cosigns_refund_at_open(self) -> bool { self.contract_kind() == ContractKind::Multisig }

    /// Each increment is answered with the payee's signature on the new refund
    pub fn countersigns_increments(self) -> bool {
        self.contract_kind() == ContractKind::Multisig
    }
}
