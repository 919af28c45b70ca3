//! Configuration for clients, servers and the channel store
//!
//! Every structure deserializes with `serde` and fills missing fields from
//! the defaults below, so a host application can load it from whatever
//! format it already uses. The Bitcoin network is always an explicit field.

use std::time::Duration;

use bitcoin::Network;
use serde::{Deserialize, Serialize};

use crate::protocol::version::ProtocolVersion;

/// Default channel lifetime requested by clients (~24 hours, minus a minute of slack)
pub const DEFAULT_TIME_WINDOW_SECS: u64 = 24 * 60 * 60 - 60;

/// Shortest channel lifetime a server accepts (4 hours)
pub const DEFAULT_MIN_TIME_WINDOW_SECS: u64 = 4 * 60 * 60;

/// Longest channel lifetime a server accepts (7 days)
pub const DEFAULT_MAX_TIME_WINDOW_SECS: u64 = 7 * 24 * 60 * 60;

/// Smallest channel a server accepts by default
pub const DEFAULT_MIN_CHANNEL_VALUE: u64 = 100_000;

/// Fee carried by every refund and settlement instrument
pub const DEFAULT_INSTRUMENT_FEE: u64 = 1_000;

/// Largest instrument fee a client agrees to
pub const DEFAULT_MAX_INSTRUMENT_FEE: u64 = 10_000;

/// Slack a client allows between its requested window and the server's expiry
pub const EXPIRY_TOLERANCE_SECS: u64 = 5 * 60;

/// Grace period after expiry before a client broadcasts its refund (5 minutes)
pub const DEFAULT_REFUND_GRACE_SECS: u64 = 5 * 60;

/// How long before expiry a server settles channels it is owed money on (2 hours)
pub const DEFAULT_SETTLE_MARGIN_SECS: u64 = 2 * 60 * 60;

/// Interval between background sweeps
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Confirmations the server waits for before opening a channel
pub const DEFAULT_MIN_DEPTH: u32 = 0;

/// Per-message timeout on regtest, where broadcasts are instant
pub const REGTEST_TIMEOUT_SECS: u64 = 15;

/// Per-message timeout on real networks, where broadcasts take a while
pub const NETWORK_TIMEOUT_SECS: u64 = 150;

/// Message timeout appropriate for `network`
pub fn default_timeout_secs(network: Network) -> u64 {
    match network {
        Network::Regtest => REGTEST_TIMEOUT_SECS,
        _ => NETWORK_TIMEOUT_SECS,
    }
}

/// Payer-side configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Network the contract and instruments are built for
    pub network: Network,
    /// Highest protocol version the client offers
    pub max_version: u32,
    /// Requested channel lifetime in seconds
    pub time_window_secs: u64,
    /// Largest per-instrument fee the client accepts from the server
    pub max_instrument_fee: u64,
    /// Timeout for each awaited server message
    pub message_timeout_secs: u64,
}

impl ClientConfig {
    /// Configuration for `network` with the default timeouts for it
    pub fn for_network(network: Network) -> Self {
        Self {
            network,
            max_version: ProtocolVersion::LATEST.number(),
            time_window_secs: DEFAULT_TIME_WINDOW_SECS,
            max_instrument_fee: DEFAULT_MAX_INSTRUMENT_FEE,
            message_timeout_secs: default_timeout_secs(network),
        }
    }

    /// Timeout for each awaited server message
    pub fn message_timeout(&self) -> Duration { Duration::from_secs(self.message_timeout_secs) }
}

impl Default for ClientConfig {
    fn default() -> Self { Self::for_network(Network::Testnet) }
}

/// Payee-side configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Network the contract and instruments are built for
    pub network: Network,
    /// Highest protocol version the server supports
    pub max_version: u32,
    /// Smallest channel value accepted
    pub min_channel_value: u64,
    /// Payment the client must make while opening a new channel
    pub min_payment: u64,
    /// Fee carried by every refund and settlement instrument
    pub instrument_fee: u64,
    /// Shortest acceptable channel lifetime in seconds
    pub min_time_window_secs: u64,
    /// Longest acceptable channel lifetime in seconds
    pub max_time_window_secs: u64,
    /// Confirmations required on the contract before the channel opens
    pub min_depth: u32,
    /// Timeout for each awaited client message during the handshake
    pub message_timeout_secs: u64,
    /// Idle time on an open channel before the server gives up on the client
    pub inactivity_timeout_secs: u64,
    /// Broadcast the latest settlement when an open channel goes idle
    pub unilateral_close_on_timeout: bool,
}

impl ServerConfig {
    /// Configuration for `network` with the default timeouts for it
    pub fn for_network(network: Network) -> Self {
        let timeout = default_timeout_secs(network);
        Self {
            network,
            max_version: ProtocolVersion::LATEST.number(),
            min_channel_value: DEFAULT_MIN_CHANNEL_VALUE,
            min_payment: DEFAULT_INSTRUMENT_FEE,
            instrument_fee: DEFAULT_INSTRUMENT_FEE,
            min_time_window_secs: DEFAULT_MIN_TIME_WINDOW_SECS,
            max_time_window_secs: DEFAULT_MAX_TIME_WINDOW_SECS,
            min_depth: DEFAULT_MIN_DEPTH,
            message_timeout_secs: timeout,
            inactivity_timeout_secs: timeout * 4,
            unilateral_close_on_timeout: false,
        }
    }

    /// Timeout for each awaited client message during the handshake
    pub fn message_timeout(&self) -> Duration { Duration::from_secs(self.message_timeout_secs) }

    /// Idle time on an open channel before the server gives up on the client
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self { Self::for_network(Network::Testnet) }
}

/// Channel store and sweep configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Seconds after expiry before a client broadcasts its refund
    pub refund_grace_secs: u64,
    /// Seconds before expiry at which a server settles channels it is owed money on
    pub settle_margin_secs: u64,
    /// Seconds between background sweeps
    pub sweep_interval_secs: u64,
}

impl StoreConfig {
    /// Interval between background sweeps
    pub fn sweep_interval(&self) -> Duration { Duration::from_secs(self.sweep_interval_secs) }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            refund_grace_secs: DEFAULT_REFUND_GRACE_SECS,
            settle_margin_secs: DEFAULT_SETTLE_MARGIN_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }
}
