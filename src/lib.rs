#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Paychan
//!
//! A Bitcoin micropayment channel engine: a payer locks value in a contract
//! with a payee, raises the amount owed off-chain as often as it likes, and
//! the channel ends in one settlement or, if the payee disappears, a
//! time-locked refund.

// Contract, instruments, ledger and per-side channel state
pub mod channel;

// Payer state machine and session driver
pub mod client;

// Client, server and store configuration
pub mod config;

// Error types and the error taxonomy
pub mod errors;

// Framing, wire messages and version negotiation
pub mod protocol;

// Payee state machine, session driver and TCP listener
pub mod server;

// Signer, broadcaster, funds and clock services
pub mod services;

// Durable channel registry and expiry sweep
pub mod store;

// Shared type definitions
pub mod types;

// Serialization helpers
pub mod utils;

// Re-export commonly used types and functions
pub use channel::{ChannelContract, ChannelLifecycle, ChannelState, Ledger};
pub use client::{ClientConnection, ClientContext, ClientHandle, ClientStateMachine, PaymentReceipt};
pub use config::{ClientConfig, ServerConfig, StoreConfig};
pub use errors::{Error, ErrorKind, Result};
pub use protocol::{CloseReason, ErrorCode, Message, ProtocolVersion};
pub use server::{
    serve_connection, HandlerFactory, ServerContext, ServerEventHandler, ServerListener,
    ServerStateMachine, Sessions,
};
pub use store::{ChannelStore, FileBackend, MemoryBackend, SweepReport};
pub use types::{ChannelId, Role, Sats, Timestamp};
