//! Error types for the payment channel engine
//!
//! Every layer has its own error enum. The crate-level [`Error`] wraps them
//! and maps each variant onto the coarse [`ErrorKind`] taxonomy callers use
//! to decide how to recover.

use thiserror::Error;

use crate::protocol::messages::{CloseReason, ErrorCode, MessageType};
use crate::types::ChannelId;

/// The main error type for the payment channel engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Contract, instrument and ledger errors
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Session and state machine errors
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Channel store errors
    #[error(transparent)]
    Store(#[from] StoreError),

    /// External collaborator (signer, broadcaster, funds) errors
    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// Coarse classification of every failure the engine reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or out-of-sequence message
    ProtocolViolation,
    /// An increment would push the payment past the channel value
    ValueOutOfRange,
    /// A counterparty tried to lower or repeat the payment
    NonMonotonicPayment,
    /// A signature did not verify
    InvalidSignature,
    /// The proposed channel is smaller than the payee accepts
    InsufficientChannelValue,
    /// The wallet cannot fund the requested value
    InsufficientFunds,
    /// A suspension point exceeded its deadline
    TimedOut,
    /// An increment is already in flight on this channel
    ConcurrentPaymentInProgress,
    /// No protocol version is supported by both sides
    UnsupportedVersion,
    /// Another session holds the channel lock
    ChannelBusy,
    /// The operation needs an open channel
    Closed,
    /// Persistence failure
    Storage,
    /// Signer or broadcaster failure
    Service,
}

/// Errors raised by the contract model, the instruments and the ledger
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ChannelError {
    /// Increments must move value
    #[error("Payment increment cannot be zero")]
    ZeroIncrement,

    /// The increment would exceed the channel value or overflow
    #[error("Payment out of range: paid {paid} + increment {amount} exceeds channel value {total}")]
    ValueOutOfRange {
        /// Amount already paid
        paid: u64,
        /// Requested increment
        amount: u64,
        /// Channel value
        total: u64,
    },

    /// The new payment does not supersede the current one
    #[error("Non-monotonic payment: current {current}, proposed {proposed}")]
    NonMonotonicPayment {
        /// Amount currently paid
        current: u64,
        /// Amount the counterparty proposed
        proposed: u64,
    },

    /// A counterparty signature failed verification
    #[error("Invalid signature on {0}")]
    InvalidSignature(String),

    /// A required signature has not been collected yet
    #[error("Missing signature: {0}")]
    MissingSignature(String),

    /// Expiry is not usable as a time-based lock time
    #[error("Invalid expiry time {0}: must be a UNIX timestamp >= 500000000")]
    InvalidExpiry(u64),

    /// The funding transaction does not pay the agreed contract
    #[error("Contract mismatch: {0}")]
    ContractMismatch(String),

    /// Contract terms are unusable
    #[error("Invalid contract: {0}")]
    InvalidContract(String),

    /// The instrument fee cannot be paid from the channel value
    #[error("Instrument fee {fee} exceeds channel value {total}")]
    FeeExceedsValue {
        /// Fee per instrument
        fee: u64,
        /// Channel value
        total: u64,
    },

    /// The contract has no funding outpoint yet
    #[error("Contract is not funded")]
    NotFunded,

    /// Sighash computation failed
    #[error("Sighash computation failed: {0}")]
    Sighash(String),

    /// The channel no longer accepts increments
    #[error("Channel is closed")]
    ChannelClosed,
}

/// Errors raised by the protocol session and the two state machines
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolError {
    /// Malformed message or one that is not legal in the current state
    #[error("Protocol violation: {0}")]
    Violation(String),

    /// A message type arrived in a state that does not expect it
    #[error("Unexpected {message:?} message in state {state}")]
    UnexpectedMessage {
        /// Lifecycle state at the time
        state: String,
        /// Type tag of the offending message
        message: MessageType,
    },

    /// No common protocol version
    #[error("Unsupported protocol version {requested}")]
    UnsupportedVersion {
        /// Highest version offered by the peer
        requested: u32,
    },

    /// Proposed channel value below the payee's minimum
    #[error("Insufficient channel value: offered {offered}, minimum {minimum}")]
    InsufficientChannelValue {
        /// Value the payer offered
        offered: u64,
        /// Minimum the payee accepts
        minimum: u64,
    },

    /// Requested channel lifetime outside what the payee accepts
    #[error("Time window {requested}s outside accepted range {min}s..={max}s")]
    TimeWindowUnacceptable {
        /// Lifetime requested by the payer
        requested: u64,
        /// Shortest accepted lifetime
        min: u64,
        /// Longest accepted lifetime
        max: u64,
    },

    /// A second increment was requested while one is pending
    #[error("A payment increment is already in progress")]
    ConcurrentPaymentInProgress,

    /// A wait exceeded its deadline
    #[error("Timed out waiting for {0}")]
    TimedOut(String),

    /// The payee's application refused the increment
    #[error("Payment rejected by payee: {0}")]
    PaymentRejected(String),

    /// The peer reported an error
    #[error("Remote error {code:?}: {explanation}")]
    Remote {
        /// Error code sent by the peer
        code: ErrorCode,
        /// Human readable explanation
        explanation: String,
    },

    /// The peer closed the channel or the session
    #[error("Closed by peer: {0:?}")]
    RemoteClosed(CloseReason),

    /// The operation needs an open channel
    #[error("Channel is not open (state {0})")]
    NotOpen(String),

    /// The channel is too close to expiry to accept payments
    #[error("Channel expired at {expiry}")]
    ChannelExpired {
        /// Contract expiry
        expiry: u64,
    },

    /// The transport went away
    #[error("Connection closed")]
    ConnectionClosed,

    /// Framing or I/O failure on the transport
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Errors raised by the channel store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StoreError {
    /// Another negotiation holds the channel lock
    #[error("Channel {0} is busy")]
    ChannelBusy(ChannelId),

    /// No record for the channel
    #[error("Channel {0} not found")]
    NotFound(ChannelId),

    /// A write was attempted without holding the channel lock
    #[error("Lock for channel {0} is not held")]
    LockNotHeld(ChannelId),

    /// Backend I/O failure
    #[error("Store I/O error: {0}")]
    Io(String),

    /// A record could not be encoded or decoded
    #[error("Record encoding error: {0}")]
    Encoding(String),

    /// A record was written by an unknown format version
    #[error("Unsupported record format version {0}")]
    UnsupportedFormat(u16),
}

/// Errors raised by external collaborator services
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ServiceError {
    /// The signer does not hold the requested key
    #[error("Key unavailable: {0}")]
    KeyUnavailable(String),

    /// Cryptographic failure inside the signer
    #[error("Crypto error: {0}")]
    CryptoError(String),

    /// The wallet cannot fund the requested value
    #[error("Insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds {
        /// Value requested
        requested: u64,
        /// Value available
        available: u64,
    },

    /// The broadcaster rejected or lost the transaction
    #[error("Broadcast failed: {0}")]
    Broadcast(String),
}

impl Error {
    /// Classifies this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Channel(e) => match e {
                ChannelError::ZeroIncrement | ChannelError::ValueOutOfRange { .. } => {
                    ErrorKind::ValueOutOfRange
                }
                ChannelError::NonMonotonicPayment { .. } => ErrorKind::NonMonotonicPayment,
                ChannelError::InvalidSignature(_) => ErrorKind::InvalidSignature,
                ChannelError::ChannelClosed => ErrorKind::Closed,
                _ => ErrorKind::ProtocolViolation,
            },
            Error::Protocol(e) => match e {
                ProtocolError::UnsupportedVersion { .. } => ErrorKind::UnsupportedVersion,
                ProtocolError::InsufficientChannelValue { .. } => {
                    ErrorKind::InsufficientChannelValue
                }
                ProtocolError::ConcurrentPaymentInProgress => {
                    ErrorKind::ConcurrentPaymentInProgress
                }
                ProtocolError::TimedOut(_) => ErrorKind::TimedOut,
                ProtocolError::NotOpen(_)
                | ProtocolError::RemoteClosed(_)
                | ProtocolError::ChannelExpired { .. } => ErrorKind::Closed,
                ProtocolError::ConnectionClosed => ErrorKind::Closed,
                ProtocolError::Remote { code, .. } => code.kind(),
                _ => ErrorKind::ProtocolViolation,
            },
            Error::Store(StoreError::ChannelBusy(_)) => ErrorKind::ChannelBusy,
            Error::Store(_) => ErrorKind::Storage,
            Error::Service(ServiceError::InsufficientFunds { .. }) => ErrorKind::InsufficientFunds,
            Error::Service(_) => ErrorKind::Service,
        }
    }

    /// Wire code reported to the peer when this error aborts a session
    pub fn code(&self) -> ErrorCode {
        match self.kind() {
            ErrorKind::UnsupportedVersion => ErrorCode::NoAcceptableVersion,
            ErrorKind::InsufficientChannelValue => ErrorCode::ChannelValueTooSmall,
            ErrorKind::TimedOut => ErrorCode::Timeout,
            ErrorKind::InvalidSignature => ErrorCode::BadTransaction,
            ErrorKind::ValueOutOfRange | ErrorKind::NonMonotonicPayment => {
                ErrorCode::BadTransaction
            }
            ErrorKind::ChannelBusy => ErrorCode::ChannelBusy,
            _ => match self {
                Error::Protocol(ProtocolError::PaymentRejected(_)) => ErrorCode::PaymentRejected,
                Error::Protocol(ProtocolError::TimeWindowUnacceptable { .. }) => {
                    ErrorCode::TimeWindowUnacceptable
                }
                Error::Protocol(ProtocolError::UnexpectedMessage { .. }) => {
                    ErrorCode::SyntaxError
                }
                _ => ErrorCode::Other,
            },
        }
    }
}

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind() {
        let err: Error = ChannelError::ValueOutOfRange { paid: 95, amount: 10, total: 100 }.into();
        assert_eq!(err.kind(), ErrorKind::ValueOutOfRange);
        assert_eq!(err.code(), ErrorCode::BadTransaction);

        let err: Error = ProtocolError::ConcurrentPaymentInProgress.into();
        assert_eq!(err.kind(), ErrorKind::ConcurrentPaymentInProgress);

        let err: Error = StoreError::ChannelBusy(ChannelId::from_bytes([1u8; 32])).into();
        assert_eq!(err.kind(), ErrorKind::ChannelBusy);

        let err: Error = ServiceError::InsufficientFunds { requested: 10, available: 1 }.into();
        assert_eq!(err.kind(), ErrorKind::InsufficientFunds);

        let err: Error = ProtocolError::ChannelExpired { expiry: 1 }.into();
        assert_eq!(err.kind(), ErrorKind::Closed);

        let err: Error = ProtocolError::UnsupportedVersion { requested: 7 }.into();
        assert_eq!(err.code(), ErrorCode::NoAcceptableVersion);

        let err: Error =
            ProtocolError::TimeWindowUnacceptable { requested: 60, min: 3600, max: 7200 }.into();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
        assert_eq!(err.code(), ErrorCode::TimeWindowUnacceptable);
    }

    #[test]
    fn test_remote_error_kind_follows_code() {
        let err: Error = ProtocolError::Remote {
            code: ErrorCode::ChannelValueTooSmall,
            explanation: "too small".to_string(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::InsufficientChannelValue);
    }

    #[test]
    fn test_display() {
        let err: Error = ChannelError::NonMonotonicPayment { current: 50, proposed: 40 }.into();
        assert_eq!(err.to_string(), "Non-monotonic payment: current 50, proposed 40");
    }
}
