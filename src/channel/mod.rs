//! Channel module for unidirectional payment channels
//!
//! This module models a channel independent of any transport: the contract
//! locking the channel value, the refund and settlement instruments spending
//! it, and the ledger enforcing monotonic, bounded payment growth.
//!
//! # Structure
//!
//! - `contract`: Contract terms and scripts
//! - `instrument`: Refund and settlement transactions, sighashes and witnesses
//! - `ledger`: `paid_so_far` and the current instrument pair
//! - `state`: Per-side persisted state and lifecycle

pub mod contract;
pub mod instrument;
pub mod ledger;
pub mod state;

#[cfg(test)]
pub mod test_utils;

pub use contract::{build_multisig_script, build_timelocked_script, ChannelContract};
pub use instrument::{calculate_instrument_outputs, parse_signature, Instrument, InstrumentKind};
pub use ledger::{IncrementProposal, IncrementSignatures, Ledger};
pub use state::{ChannelLifecycle, ChannelState};
