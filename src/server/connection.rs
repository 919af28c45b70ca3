//! Server session driver
//!
//! Reads client messages with a per-message timeout, feeds them to the
//! [`ServerStateMachine`] and writes its replies. While the channel is open
//! the read timeout becomes the inactivity timeout, and the channel is
//! settled when its settle deadline passes.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tracing::{debug, instrument, warn};

use super::{ServerLifecycle, ServerStateMachine, ServerStep};
use crate::errors::{Error, ErrorKind, ProtocolError, Result};
use crate::protocol::messages::Message;
use crate::protocol::{self, Transport};

/// Asks a running session to settle its channel
#[derive(Debug, Clone, Default)]
pub struct CloseHandle(Arc<Notify>);

impl CloseHandle {
    /// Requests settlement; takes effect once the channel is open and idle
    pub fn close(&self) { self.0.notify_one() }
}

/// One server session over a byte stream
pub struct ServerConnection<S> {
    machine: ServerStateMachine,
    transport: Transport<S>,
    close: CloseHandle,
}

fn should_report(error: &Error) -> bool {
    !matches!(
        error,
        Error::Protocol(
            ProtocolError::Remote { .. }
                | ProtocolError::ConnectionClosed
                | ProtocolError::Transport(_)
        )
    )
}

impl<S> ServerConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps `stream` for `machine`
    pub fn new(stream: S, machine: ServerStateMachine) -> Self {
        Self { machine, transport: protocol::framed(stream), close: CloseHandle::default() }
    }

    /// Handle for settling the channel from outside the session
    pub fn close_handle(&self) -> CloseHandle { self.close.clone() }

    /// Runs the session to completion
    ///
    /// Returns the final lifecycle: `Closed` when the channel settled,
    /// `Disconnected` when it stays open for a later resume.
    ///
    /// # Errors
    /// The error that aborted the session; the client is sent an `ERROR`
    /// when the failure is local.
    #[instrument(skip_all, name = "server_session")]
    pub async fn run(mut self) -> Result<ServerLifecycle> {
        let result = self.drive().await;
        if let Err(e) = &result {
            warn!(error = %e, lifecycle = %self.machine.lifecycle(), "server session aborted");
            if should_report(e) {
                let message = Message::error(e.code(), e.to_string());
                let _ = protocol::send(&mut self.transport, message).await;
            }
        }
        self.machine.disconnect(result.as_ref().err().map(Error::kind)).await;
        result.map(|()| self.machine.lifecycle())
    }

    async fn send_all(&mut self, step: ServerStep) -> Result<()> {
        for message in step.outbound {
            protocol::send(&mut self.transport, message).await?;
        }
        Ok(())
    }

    async fn drive(&mut self) -> Result<()> {
        loop {
            let open = self.machine.is_open();
            let timeout = if open {
                self.machine.config().inactivity_timeout()
            } else {
                self.machine.config().message_timeout()
            };
            let settle_in = self.machine.until_settle_deadline().filter(|_| open);
            let waiting_for = self.machine.lifecycle().to_string();

            tokio::select! {
                () = self.close.0.notified(), if open => {
                    let step = self.machine.close().await?;
                    return self.send_all(step).await;
                }
                () = sleep_for(settle_in) => {
                    let step = self.machine.expire().await?;
                    return self.send_all(step).await;
                }
                received = protocol::recv(&mut self.transport, timeout, &waiting_for) => {
                    let message = match received {
                        Ok(message) => message,
                        Err(e) if open && e.kind() == ErrorKind::TimedOut => {
                            let step = self.machine.inactivity_timeout().await?;
                            debug!(lifecycle = %self.machine.lifecycle(), "idle client dropped");
                            // The client may already be gone
                            let _ = self.send_all(step).await;
                            return Ok(());
                        }
                        Err(e) => return Err(e),
                    };
                    let step = self.machine.receive(message).await?;
                    let finished = step.finished;
                    self.send_all(step).await?;
                    if finished {
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn sleep_for(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

/// Serves one client over `stream` until the session ends
pub async fn serve_connection<S>(stream: S, machine: ServerStateMachine) -> Result<ServerLifecycle>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    ServerConnection::new(stream, machine).run().await
}
