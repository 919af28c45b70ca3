//! Wire messages exchanged between payer and payee
//!
//! The [`Message`] enum is the unit of framing: postcard encodes the variant
//! index first, which doubles as the type tag on the wire.

use bitcoin::{OutPoint, PublicKey, Transaction};
use serde::{Deserialize, Serialize};

use crate::errors::ErrorKind;
use crate::types::{ChannelId, Sats, Timestamp};

/// A single protocol message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// First message from the payer: version preference and optional resume
    ClientVersion {
        /// Highest protocol version the payer speaks
        max_version: u32,
        /// Server-side identifier of a channel the payer wants to resume
        previous_channel: Option<ChannelId>,
        /// Requested channel lifetime in seconds
        time_window_secs: u64,
    },

    /// Payee's answer to a new-channel request
    VersionSelect {
        /// Negotiated protocol version
        version: u32,
        /// Key the payee signs with
        payee_key: PublicKey,
        /// Smallest channel the payee accepts
        min_channel_value: Sats,
        /// Payment required as soon as the channel opens
        min_payment: Sats,
        /// Fee carried by every refund and settlement
        instrument_fee: Sats,
        /// Expiry the payee wants on the contract
        expiry_time: Timestamp,
    },

    /// Payer's contract terms
    ContractProposal {
        /// Value locked in the contract
        total_value: Sats,
        /// Absolute expiry of the contract
        expiry_time: Timestamp,
        /// Key the payer signs with
        payer_key: PublicKey,
        /// Outpoint the contract output will be created at
        funding: OutPoint,
    },

    /// Payer asks the payee to co-sign the initial refund
    RefundUnsigned {
        /// Refund paying the whole contract back to the payer
        #[serde(with = "crate::utils::consensus_tx")]
        refund: Transaction,
    },

    /// Payee's signature on the initial refund
    RefundSigned {
        /// DER encoded ECDSA signature
        signature: Vec<u8>,
    },

    /// The funded contract transaction
    ContractFunded {
        /// Transaction creating the contract output
        #[serde(with = "crate::utils::consensus_tx")]
        contract: Transaction,
    },

    /// The channel is open (new or resumed)
    ChannelOpenAck {
        /// Payee-side channel identifier, presented again on resume
        channel_id: ChannelId,
        /// Contract expiry
        expiry_time: Timestamp,
        /// Amount paid so far as the payee sees it
        paid_so_far: Sats,
    },

    /// Payer raises the amount owed to the payee
    PaymentIncrement {
        /// Value added by this increment
        amount: Sats,
        /// Cumulative amount after the increment
        paid_so_far: Sats,
        /// Payer signature over the new settlement
        settlement_signature: Vec<u8>,
        /// Opaque application data passed to the payee handler
        info: Option<Vec<u8>>,
    },

    /// Payee accepted an increment
    PaymentAck {
        /// Payee signature over the new refund, when increments are countersigned
        refund_signature: Option<Vec<u8>>,
        /// Opaque application data returned by the payee handler
        info: Option<Vec<u8>>,
    },

    /// Payer requests cooperative settlement
    SettleRequest,

    /// The fully signed settlement the payee broadcast
    SettleInstrument {
        /// Broadcast settlement transaction
        #[serde(with = "crate::utils::consensus_tx")]
        settlement: Transaction,
        /// Why the payee closed the channel
        reason: CloseReason,
    },

    /// Orderly end of the session
    Close {
        /// Why the sender is closing
        reason: CloseReason,
    },

    /// The sender aborted the session
    Error {
        /// Machine readable cause
        code: ErrorCode,
        /// Human readable explanation
        explanation: String,
    },
}

/// Type tag of a [`Message`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// `CLIENT_VERSION`
    ClientVersion,
    /// `VERSION_SELECT`
    VersionSelect,
    /// `CONTRACT_PROPOSAL`
    ContractProposal,
    /// `REFUND_UNSIGNED`
    RefundUnsigned,
    /// `REFUND_SIGNED`
    RefundSigned,
    /// `CONTRACT_FUNDED`
    ContractFunded,
    /// `CHANNEL_OPEN_ACK`
    ChannelOpenAck,
    /// `PAYMENT_INCREMENT`
    PaymentIncrement,
    /// `PAYMENT_ACK`
    PaymentAck,
    /// `SETTLE_REQUEST`
    SettleRequest,
    /// `SETTLE_INSTRUMENT`
    SettleInstrument,
    /// `CLOSE`
    Close,
    /// `ERROR`
    Error,
}

impl Message {
    /// Type tag of this message
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::ClientVersion { .. } => MessageType::ClientVersion,
            Message::VersionSelect { .. } => MessageType::VersionSelect,
            Message::ContractProposal { .. } => MessageType::ContractProposal,
            Message::RefundUnsigned { .. } => MessageType::RefundUnsigned,
            Message::RefundSigned { .. } => MessageType::RefundSigned,
            Message::ContractFunded { .. } => MessageType::ContractFunded,
            Message::ChannelOpenAck { .. } => MessageType::ChannelOpenAck,
            Message::PaymentIncrement { .. } => MessageType::PaymentIncrement,
            Message::PaymentAck { .. } => MessageType::PaymentAck,
            Message::SettleRequest => MessageType::SettleRequest,
            Message::SettleInstrument { .. } => MessageType::SettleInstrument,
            Message::Close { .. } => MessageType::Close,
            Message::Error { .. } => MessageType::Error,
        }
    }

    /// Builds an `ERROR` message
    pub fn error(code: ErrorCode, explanation: impl Into<String>) -> Self {
        Message::Error { code, explanation: explanation.into() }
    }
}

/// Why a session or channel was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloseReason {
    /// The payer asked to settle
    ClientRequested,
    /// The payee decided to settle
    ServerRequested,
    /// The contract expired
    ChannelExpired,
    /// The counterparty stopped responding
    Timeout,
    /// The transport went away
    ConnectionClosed,
    /// The counterparty sent an `ERROR`
    RemoteError,
    /// The counterparty broke the protocol
    ProtocolViolation,
}

/// Error code carried by the `ERROR` message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The sender stopped waiting
    Timeout,
    /// Malformed or out-of-sequence message
    SyntaxError,
    /// No common protocol version
    NoAcceptableVersion,
    /// A transaction or signature failed validation
    BadTransaction,
    /// Requested expiry outside the accepted window
    TimeWindowUnacceptable,
    /// Channel value below the payee minimum
    ChannelValueTooSmall,
    /// Another session owns the channel
    ChannelBusy,
    /// The payee application refused an increment
    PaymentRejected,
    /// Anything else
    Other,
}

impl ErrorCode {
    /// Local error classification for a code received from the peer
    pub fn kind(&self) -> ErrorKind {
        match self {
            ErrorCode::Timeout => ErrorKind::TimedOut,
            ErrorCode::NoAcceptableVersion => ErrorKind::UnsupportedVersion,
            ErrorCode::ChannelValueTooSmall => ErrorKind::InsufficientChannelValue,
            ErrorCode::ChannelBusy => ErrorKind::ChannelBusy,
            ErrorCode::SyntaxError
            | ErrorCode::BadTransaction
            | ErrorCode::TimeWindowUnacceptable
            | ErrorCode::PaymentRejected
            | ErrorCode::Other => ErrorKind::ProtocolViolation,
        }
    }
}
