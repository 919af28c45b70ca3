//! Per-side channel state
//!
//! [`ChannelState`] is what each side persists: the ledger (and through it
//! the contract and current instruments) plus lifecycle bookkeeping.
//!
//! Lifecycle transitions:
//! - Opening → Open (initial payment acknowledged)
//! - Opening | Open → Closed (settled, refunded or expired)
//!
//! Only `Open` channels can be resumed. An `Opening` record still holds a
//! funded contract, so the sweep refunds it like any other.

use bitcoin::{PublicKey, Txid};
use serde::{Deserialize, Serialize};

use crate::channel::contract::ChannelContract;
use crate::channel::ledger::Ledger;
use crate::protocol::messages::CloseReason;
use crate::types::{ChannelId, Role, Sats, Timestamp};

/// Persisted lifecycle of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelLifecycle {
    /// Contract funded, initial payment not yet acknowledged
    Opening,
    /// Channel is active and can process increments
    Open,
    /// Channel is permanently closed, no further transitions allowed
    Closed,
}

/// Everything one side knows about a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelState {
    /// Local identifier, stable across reconnects
    pub channel_id: ChannelId,
    /// Which side this state belongs to
    pub role: Role,
    /// Current lifecycle
    pub lifecycle: ChannelLifecycle,
    /// Contract, paid amount and current instruments
    pub ledger: Ledger,
    /// Server the channel was opened with (client side)
    pub server_id: Option<String>,
    /// The server's identifier for this channel (client side)
    pub remote_channel_id: Option<ChannelId>,
    /// Instruments already handed to the broadcaster
    pub broadcast_txids: Vec<Txid>,
    /// A counterparty signature failed while the channel was open
    pub needs_review: bool,
    /// Why the channel closed
    pub close_reason: Option<CloseReason>,
    /// Last time this state was persisted
    pub updated_at: Timestamp,
}

impl ChannelState {
    /// Creates the payer's state for a channel with `server_id`
    pub fn new_client(
        server_id: &str,
        remote_channel_id: ChannelId,
        ledger: Ledger,
        now: Timestamp,
    ) -> Self {
        Self {
            channel_id: ChannelId::for_server(server_id),
            role: Role::Client,
            lifecycle: ChannelLifecycle::Open,
            ledger,
            server_id: Some(server_id.to_string()),
            remote_channel_id: Some(remote_channel_id),
            broadcast_txids: Vec::new(),
            needs_review: false,
            close_reason: None,
            updated_at: now,
        }
    }

    /// Creates the payee's state for a freshly funded channel
    pub fn new_server(channel_id: ChannelId, ledger: Ledger, now: Timestamp) -> Self {
        Self {
            channel_id,
            role: Role::Server,
            lifecycle: ChannelLifecycle::Open,
            ledger,
            server_id: None,
            remote_channel_id: None,
            broadcast_txids: Vec::new(),
            needs_review: false,
            close_reason: None,
            updated_at: now,
        }
    }

    /// Contract terms
    pub fn contract(&self) -> &ChannelContract { self.ledger.contract() }

    /// Amount owed to the payee
    pub fn paid_so_far(&self) -> Sats { self.ledger.paid_so_far() }

    /// Contract expiry
    pub fn expiry_time(&self) -> Timestamp { self.contract().expiry_time }

    /// Key of the other side
    pub fn counterparty_key(&self) -> PublicKey {
        match self.role {
            Role::Client => self.contract().payee_key,
            Role::Server => self.contract().payer_key,
        }
    }

    /// Whether the channel still accepts increments
    pub fn is_open(&self) -> bool { self.lifecycle == ChannelLifecycle::Open }

    /// Whether the channel is finished
    pub fn is_closed(&self) -> bool { self.lifecycle == ChannelLifecycle::Closed }

    /// Whether the channel can be resumed at `now`
    pub fn is_resumable(&self, now: Timestamp) -> bool {
        self.is_open() && !self.contract().is_expired(now)
    }

    /// Marks the channel closed
    pub fn mark_closed(&mut self, reason: CloseReason, now: Timestamp) {
        self.lifecycle = ChannelLifecycle::Closed;
        self.close_reason = Some(reason);
        self.updated_at = now;
    }

    /// Records a broadcast, returning `false` when `txid` was already recorded
    pub fn record_broadcast(&mut self, txid: Txid) -> bool {
        if self.broadcast_txids.contains(&txid) {
            return false;
        }
        self.broadcast_txids.push(txid);
        true
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::Hash;

    use super::*;
    use crate::channel::test_utils::{funded_contract, test_keys, TEST_EXPIRY};
    use crate::protocol::version::ProtocolVersion;

    fn client_state() -> ChannelState {
        let ledger = Ledger::new(funded_contract(ProtocolVersion::V2, 100_000), 1_000)
            .expect("ledger");
        ChannelState::new_client("server-a", ChannelId::from_bytes([1u8; 32]), ledger, 0)
    }

    #[test]
    fn test_client_state() {
        let state = client_state();
        let (_, payee) = test_keys();
        assert_eq!(state.channel_id, ChannelId::for_server("server-a"));
        assert_eq!(state.counterparty_key(), payee);
        assert!(state.is_open());
        assert!(state.is_resumable(TEST_EXPIRY - 1));
        assert!(!state.is_resumable(TEST_EXPIRY));
    }

    #[test]
    fn test_opening_is_not_resumable() {
        let mut state = client_state();
        state.lifecycle = ChannelLifecycle::Opening;
        assert!(!state.is_resumable(0));
        assert!(!state.is_closed());
    }

    #[test]
    fn test_mark_closed() {
        let mut state = client_state();
        state.mark_closed(CloseReason::ChannelExpired, 42);
        assert!(state.is_closed());
        assert!(!state.is_resumable(0));
        assert_eq!(state.close_reason, Some(CloseReason::ChannelExpired));
        assert_eq!(state.updated_at, 42);
    }

    #[test]
    fn test_record_broadcast_once() {
        let mut state = client_state();
        let txid = Txid::from_byte_array([4u8; 32]);
        assert!(state.record_broadcast(txid));
        assert!(!state.record_broadcast(txid));
        assert_eq!(state.broadcast_txids.len(), 1);
    }
}
