//! Protocol session layer
//!
//! Framing, wire messages and version negotiation, plus the timed
//! send/receive helpers both session drivers use.

pub mod codec;
pub mod messages;
pub mod version;

use std::io;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

pub use codec::MessageCodec;
pub use messages::{CloseReason, ErrorCode, Message, MessageType};
pub use version::{ContractKind, ProtocolVersion};

use crate::errors::{ProtocolError, Result};

/// A byte stream framed into [`Message`]s
pub type Transport<S> = Framed<S, MessageCodec>;

/// Frames `stream` with [`MessageCodec`]
pub fn framed<S: AsyncRead + AsyncWrite>(stream: S) -> Transport<S> {
    Framed::new(stream, MessageCodec::new())
}

fn transport_error(err: io::Error) -> ProtocolError {
    match err.kind() {
        io::ErrorKind::InvalidData => ProtocolError::Violation(err.to_string()),
        _ => ProtocolError::Transport(err.to_string()),
    }
}

/// Sends one message
pub async fn send<S>(transport: &mut Transport<S>, message: Message) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    transport.send(message).await.map_err(transport_error)?;
    Ok(())
}

/// Receives one message, failing with `TimedOut` after `timeout`
///
/// # Arguments
/// * `waiting_for` - Label used in the timeout error
///
/// # Errors
/// `ConnectionClosed` on end of stream, `Violation` on a malformed frame.
pub async fn recv<S>(
    transport: &mut Transport<S>,
    timeout: Duration,
    waiting_for: &str,
) -> Result<Message>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout(timeout, transport.next()).await {
        Err(_) => Err(ProtocolError::TimedOut(waiting_for.to_string()).into()),
        Ok(None) => Err(ProtocolError::ConnectionClosed.into()),
        Ok(Some(Err(e))) => Err(transport_error(e).into()),
        Ok(Some(Ok(message))) => Ok(message),
    }
}
