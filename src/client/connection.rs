//! Client session driver
//!
//! [`ClientConnection::open`] runs the opening handshake on a byte stream and
//! then hands the session to a background actor. The actor owns the
//! transport and the [`ClientStateMachine`] and runs a `select!` loop over:
//!
//! 1. Requests from [`ClientHandle`]s
//! 2. Frames from the server
//! 3. The deadline of the request in flight, if any
//!
//! At most one increment or settlement is in flight at a time.

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::{ClientEvent, ClientSnapshot, ClientStateMachine};
use crate::errors::{Error, ProtocolError, Result};
use crate::protocol::messages::{CloseReason, Message};
use crate::protocol::{self, Transport};
use crate::types::Sats;

/// Acknowledged increment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentReceipt {
    /// Value added by the increment
    pub amount: Sats,
    /// Cumulative amount after the increment
    pub paid_so_far: Sats,
    /// Application data returned by the payee
    pub info: Option<Vec<u8>>,
}

enum Command {
    Increment {
        amount: Sats,
        info: Option<Vec<u8>>,
        reply: oneshot::Sender<Result<PaymentReceipt>>,
    },
    Settle {
        reply: oneshot::Sender<Result<bitcoin::Transaction>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

enum Pending {
    Increment(oneshot::Sender<Result<PaymentReceipt>>),
    Settle(oneshot::Sender<Result<bitcoin::Transaction>>),
}

impl Pending {
    fn fail(self, error: Error) {
        match self {
            Pending::Increment(reply) => {
                let _ = reply.send(Err(error));
            }
            Pending::Settle(reply) => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

/// Whether a local failure should be reported to the server
fn should_report(error: &Error) -> bool {
    !matches!(
        error,
        Error::Protocol(
            ProtocolError::Remote { .. }
                | ProtocolError::RemoteClosed(_)
                | ProtocolError::ConnectionClosed
                | ProtocolError::Transport(_)
        )
    )
}

fn error_message(error: &Error) -> Message { Message::error(error.code(), error.to_string()) }

/// Background actor owning one client session
pub struct ClientConnection<S> {
    machine: ClientStateMachine,
    transport: Transport<S>,
    commands: mpsc::Receiver<Command>,
    snapshot: watch::Sender<ClientSnapshot>,
    pending: Option<(Pending, Instant)>,
}

impl ClientConnection<TcpStream> {
    /// Connects to `addr` over TCP and opens the channel
    pub async fn connect(
        addr: impl ToSocketAddrs,
        machine: ClientStateMachine,
    ) -> Result<ClientHandle> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ProtocolError::Transport(e.to_string()))?;
        Self::open(stream, machine).await
    }
}

impl<S> ClientConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Opens or resumes the channel over `stream`
    ///
    /// Returns once the channel is open, including the initial payment the
    /// server may require. The session then continues in the background.
    ///
    /// # Errors
    /// Any handshake failure. The server is sent an `ERROR` when the failure
    /// is local, and an unbroadcast contract is released back to the wallet.
    pub async fn open(stream: S, mut machine: ClientStateMachine) -> Result<ClientHandle> {
        let mut transport = protocol::framed(stream);
        if let Err(e) = Self::handshake(&mut machine, &mut transport).await {
            warn!(error = %e, "channel handshake failed");
            if should_report(&e) {
                let _ = protocol::send(&mut transport, error_message(&e)).await;
            }
            machine.disconnect().await;
            return Err(e);
        }

        let (command_tx, commands) = mpsc::channel(16);
        let (snapshot, snapshot_rx) = watch::channel(machine.snapshot());
        let connection = Self { machine, transport, commands, snapshot, pending: None };
        tokio::spawn(connection.run());
        Ok(ClientHandle { commands: command_tx, snapshot: snapshot_rx })
    }

    async fn handshake(machine: &mut ClientStateMachine, transport: &mut Transport<S>) -> Result<()> {
        let hello = machine.start()?;
        protocol::send(transport, hello).await?;
        let timeout = machine.config().message_timeout();
        loop {
            let waiting_for = machine.lifecycle().to_string();
            let message = protocol::recv(transport, timeout, &waiting_for).await?;
            let step = machine.receive(message).await?;
            for message in step.outbound {
                protocol::send(transport, message).await?;
            }
            match step.event {
                Some(ClientEvent::Opened { resumed }) => {
                    info!(resumed, "channel ready");
                    return Ok(());
                }
                Some(ClientEvent::Settled { reason, .. }) => {
                    return Err(ProtocolError::RemoteClosed(reason).into());
                }
                _ => {}
            }
        }
    }

    /// Runs the session until it ends
    #[instrument(skip_all, name = "client_session")]
    async fn run(mut self) {
        loop {
            let deadline = self.pending.as_ref().map(|(_, deadline)| *deadline);
            let keep_running = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("all client handles dropped");
                        false
                    }
                },
                frame = self.transport.next() => match frame {
                    Some(Ok(message)) => self.handle_message(message).await,
                    Some(Err(e)) => {
                        self.abort(ProtocolError::Violation(e.to_string()).into()).await;
                        false
                    }
                    None => {
                        self.abort(ProtocolError::ConnectionClosed.into()).await;
                        false
                    }
                },
                () = sleep_until(deadline) => {
                    let waiting_for = self.machine.lifecycle().to_string();
                    self.abort(ProtocolError::TimedOut(waiting_for).into()).await;
                    false
                }
            };
            self.snapshot.send_replace(self.machine.snapshot());
            if !keep_running {
                break;
            }
        }

        self.machine.disconnect().await;
        self.snapshot.send_replace(self.machine.snapshot());
        info!(lifecycle = %self.machine.lifecycle(), "client session ended");
    }

    async fn handle_command(&mut self, command: Command) -> bool {
        let deadline = Instant::now() + self.machine.config().message_timeout();
        match command {
            Command::Increment { amount, info, reply } => {
                match self.machine.begin_increment(amount, info).await {
                    Ok(message) => {
                        self.pending = Some((Pending::Increment(reply), deadline));
                        self.send(message).await
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        true
                    }
                }
            }
            Command::Settle { reply } => match self.machine.begin_settle() {
                Ok(message) => {
                    self.pending = Some((Pending::Settle(reply), deadline));
                    self.send(message).await
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                    true
                }
            },
            Command::Disconnect { reply } => {
                let close = Message::Close { reason: CloseReason::ConnectionClosed };
                let _ = protocol::send(&mut self.transport, close).await;
                if let Some((pending, _)) = self.pending.take() {
                    pending.fail(ProtocolError::ConnectionClosed.into());
                }
                let _ = reply.send(());
                false
            }
        }
    }

    async fn handle_message(&mut self, message: Message) -> bool {
        let step = match self.machine.receive(message).await {
            Ok(step) => step,
            Err(e) => {
                self.abort(e).await;
                return false;
            }
        };
        for message in step.outbound {
            if !self.send(message).await {
                return false;
            }
        }

        match (step.event, self.pending.take()) {
            (Some(ClientEvent::PaymentAcked(receipt)), Some((Pending::Increment(reply), _))) => {
                let _ = reply.send(Ok(receipt));
                true
            }
            (Some(ClientEvent::PaymentRejected(reason)), Some((Pending::Increment(reply), _))) => {
                let _ = reply.send(Err(ProtocolError::PaymentRejected(reason).into()));
                true
            }
            (Some(ClientEvent::Settled { settlement, .. }), Some((Pending::Settle(reply), _))) => {
                let _ = reply.send(Ok(settlement));
                false
            }
            (Some(ClientEvent::Settled { reason, .. }), pending) => {
                if let Some((pending, _)) = pending {
                    pending.fail(ProtocolError::RemoteClosed(reason).into());
                }
                false
            }
            (_, pending) => {
                self.pending = pending;
                true
            }
        }
    }

    async fn send(&mut self, message: Message) -> bool {
        match protocol::send(&mut self.transport, message).await {
            Ok(()) => true,
            Err(e) => {
                self.abort(e).await;
                false
            }
        }
    }

    /// Fails the request in flight and tells the server why
    async fn abort(&mut self, error: Error) {
        warn!(error = %error, lifecycle = %self.machine.lifecycle(), "client session aborted");
        if should_report(&error) {
            let _ = protocol::send(&mut self.transport, error_message(&error)).await;
        }
        if let Some((pending, _)) = self.pending.take() {
            pending.fail(error);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Cloneable handle to a running client session
#[derive(Clone)]
pub struct ClientHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<ClientSnapshot>,
}

impl ClientHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        response.await.map_err(|_| ProtocolError::ConnectionClosed)?
    }

    /// Pays `amount` more and waits for the server's acknowledgement
    ///
    /// # Errors
    /// * `ProtocolError::ConcurrentPaymentInProgress` - If another increment is in flight
    /// * `ChannelError::ValueOutOfRange` - If the channel cannot cover `amount`
    /// * `ProtocolError::PaymentRejected` - If the server application refused it
    pub async fn increment_payment(&self, amount: Sats) -> Result<PaymentReceipt> {
        self.increment_payment_with_info(amount, None).await
    }

    /// Pays `amount` more, passing `info` to the server application
    pub async fn increment_payment_with_info(
        &self,
        amount: Sats,
        info: Option<Vec<u8>>,
    ) -> Result<PaymentReceipt> {
        self.request(|reply| Command::Increment { amount, info, reply }).await
    }

    /// Asks the server to settle and waits for the broadcast settlement
    pub async fn settle(&self) -> Result<bitcoin::Transaction> {
        self.request(|reply| Command::Settle { reply }).await
    }

    /// Ends the session, leaving the channel open for a later resume
    pub async fn disconnect_without_settlement(&self) {
        let (reply, response) = oneshot::channel();
        if self.commands.send(Command::Disconnect { reply }).await.is_ok() {
            let _ = response.await;
        }
    }

    /// Latest view of the session
    pub fn state(&self) -> ClientSnapshot { self.snapshot.borrow().clone() }

    /// Resolves once the session has ended
    pub async fn closed(&self) { self.commands.closed().await }
}
