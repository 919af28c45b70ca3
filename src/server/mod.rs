//! Payee-side state machine
//!
//! [`ServerStateMachine`] accepts one payer per session: it negotiates the
//! contract, co-signs what the protocol version requires, applies payment
//! increments after consulting the application's [`ServerEventHandler`] and
//! broadcasts the settlement when the channel closes.
//!
//! States: `AwaitVersion → AwaitContractProposal → AwaitRefundForCosign →
//! AwaitContractBroadcastConfirm → Open → (ApplyIncrement)* → Closing →
//! Closed`. A resumed channel goes from `AwaitVersion` straight to `Open`.
//!
//! Once the store's settle margin before expiry is reached the payee stops
//! accepting payments and settles, whether or not the payer asked to.

pub mod connection;
pub mod listener;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::{PublicKey, Transaction};
use tracing::{debug, info, warn};

pub use connection::{serve_connection, CloseHandle, ServerConnection};
pub use listener::{ServerListener, Sessions};

use crate::channel::instrument::parse_signature;
use crate::channel::ledger::IncrementSignatures;
use crate::channel::state::ChannelState;
use crate::channel::{ChannelContract, Ledger};
use crate::config::ServerConfig;
use crate::errors::{ErrorKind, ProtocolError, Result, StoreError};
use crate::protocol::messages::{CloseReason, ErrorCode, Message};
use crate::protocol::version::ProtocolVersion;
use crate::services::{Broadcaster, Signer};
use crate::store::{ChannelGuard, ChannelStore};
use crate::types::{ChannelId, Role, Sats, Timestamp};

/// Lifecycle of the payee's session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerLifecycle {
    /// Waiting for `CLIENT_VERSION`
    AwaitVersion,
    /// Terms sent, waiting for `CONTRACT_PROPOSAL`
    AwaitContractProposal,
    /// Waiting for the refund to co-sign
    AwaitRefundForCosign,
    /// Waiting for the funded contract
    AwaitContractBroadcastConfirm,
    /// Channel open
    Open,
    /// An increment is being applied
    ApplyIncrement,
    /// Settlement being produced
    Closing,
    /// Channel settled
    Closed,
    /// Session ended with the channel still open
    Disconnected,
}

impl fmt::Display for ServerLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{self:?}") }
}

/// Application callbacks for one server session
///
/// Invoked in line with the session at the transition they describe.
#[async_trait]
pub trait ServerEventHandler: Send + Sync {
    /// A channel was opened or resumed
    async fn channel_open(&self, _channel_id: ChannelId, _contract: &ChannelContract) {}

    /// The payer wants to pay `delta` more, `total` in all
    ///
    /// Returning `Err(reason)` refuses the increment and keeps the previous
    /// amount. `Ok(info)` accepts it; `info` is returned to the payer.
    async fn payment_increase(
        &self,
        _delta: Sats,
        _total: Sats,
        _info: Option<Vec<u8>>,
    ) -> std::result::Result<Option<Vec<u8>>, String> {
        Ok(None)
    }

    /// The session ended
    async fn channel_closed(&self, _reason: CloseReason) {}
}

/// Handler that accepts every payment
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

#[async_trait]
impl ServerEventHandler for AcceptAll {}

/// Builds a [`ServerEventHandler`] for each accepted connection
pub trait HandlerFactory: Send + Sync {
    /// Handler for the connection from `peer`
    fn create(&self, peer: &str) -> Arc<dyn ServerEventHandler>;
}

impl<F> HandlerFactory for F
where
    F: Fn(&str) -> Arc<dyn ServerEventHandler> + Send + Sync,
{
    fn create(&self, peer: &str) -> Arc<dyn ServerEventHandler> { self(peer) }
}

/// Collaborators the payee needs
#[derive(Clone)]
pub struct ServerContext {
    /// Holds the payee key
    pub signer: Arc<dyn Signer>,
    /// Publishes contracts and settlements
    pub broadcaster: Arc<dyn Broadcaster>,
    /// Persists channels
    pub store: Arc<ChannelStore>,
}

/// Result of feeding one message to the state machine
#[derive(Debug, Default)]
pub struct ServerStep {
    /// Messages to send, in order
    pub outbound: Vec<Message>,
    /// The session is over once these are sent
    pub finished: bool,
}

impl ServerStep {
    fn send(message: Message) -> Self { Self { outbound: vec![message], finished: false } }

    fn finish(outbound: Vec<Message>) -> Self { Self { outbound, finished: true } }
}

struct Negotiation {
    version: ProtocolVersion,
    expiry_time: Timestamp,
    ledger: Option<Ledger>,
}

fn violation(reason: impl Into<String>) -> crate::errors::Error {
    ProtocolError::Violation(reason.into()).into()
}

/// Payee-side protocol state machine for one session
pub struct ServerStateMachine {
    config: ServerConfig,
    context: ServerContext,
    payee_key: PublicKey,
    handler: Arc<dyn ServerEventHandler>,
    lifecycle: ServerLifecycle,
    negotiation: Option<Negotiation>,
    guard: Option<ChannelGuard>,
    state: Option<ChannelState>,
    close_reason: Option<CloseReason>,
}

impl ServerStateMachine {
    /// Creates a machine signing with `payee_key`
    pub fn new(
        config: ServerConfig,
        context: ServerContext,
        payee_key: PublicKey,
        handler: Arc<dyn ServerEventHandler>,
    ) -> Self {
        Self {
            config,
            context,
            payee_key,
            handler,
            lifecycle: ServerLifecycle::AwaitVersion,
            negotiation: None,
            guard: None,
            state: None,
            close_reason: None,
        }
    }

    /// Current lifecycle
    pub fn lifecycle(&self) -> ServerLifecycle { self.lifecycle }

    /// Server configuration
    pub fn config(&self) -> &ServerConfig { &self.config }

    /// Channel state once open
    pub fn state(&self) -> Option<&ChannelState> { self.state.as_ref() }

    /// Whether the channel is open and idle
    pub fn is_open(&self) -> bool { self.lifecycle == ServerLifecycle::Open }

    fn now(&self) -> Timestamp { self.context.store.now() }

    fn settle_deadline(state: &ChannelState, margin: u64) -> Timestamp {
        state.expiry_time().saturating_sub(margin)
    }

    fn past_settle_deadline(&self, state: &ChannelState) -> bool {
        self.now() >= Self::settle_deadline(state, self.context.store.config().settle_margin_secs)
    }

    /// Time left before the open channel must be settled
    pub fn until_settle_deadline(&self) -> Option<Duration> {
        let state = self.state.as_ref()?;
        let deadline = Self::settle_deadline(state, self.context.store.config().settle_margin_secs);
        Some(Duration::from_secs(deadline.saturating_sub(self.now())))
    }

    fn unexpected(&self, message: &Message) -> crate::errors::Error {
        ProtocolError::UnexpectedMessage {
            state: self.lifecycle.to_string(),
            message: message.message_type(),
        }
        .into()
    }

    fn persist(&self, state: &ChannelState) -> Result<()> {
        match &self.guard {
            Some(guard) => self.context.store.persist(guard, state),
            None => Err(StoreError::LockNotHeld(state.channel_id).into()),
        }
    }

    /// Feeds one client message to the machine
    ///
    /// # Errors
    /// Any error ends the session; persisted state is left at its last good value.
    pub async fn receive(&mut self, message: Message) -> Result<ServerStep> {
        match message {
            Message::Error { code, explanation } => {
                warn!(?code, %explanation, "client reported an error");
                self.close_reason = Some(CloseReason::RemoteError);
                Err(ProtocolError::Remote { code, explanation }.into())
            }
            Message::Close { reason } => {
                debug!(?reason, "client closed the session");
                self.close_reason = Some(CloseReason::ConnectionClosed);
                Ok(ServerStep::finish(Vec::new()))
            }
            Message::ClientVersion { max_version, previous_channel, time_window_secs }
                if self.lifecycle == ServerLifecycle::AwaitVersion =>
            {
                if let Some(channel_id) = previous_channel {
                    if let Some(step) = self.try_resume(channel_id).await? {
                        return Ok(step);
                    }
                }
                self.select_version(max_version, time_window_secs)
            }
            Message::ContractProposal { total_value, expiry_time, payer_key, funding }
                if self.lifecycle == ServerLifecycle::AwaitContractProposal =>
            {
                let negotiation =
                    self.negotiation.as_mut().ok_or_else(|| violation("no terms offered"))?;
                if total_value < self.config.min_channel_value {
                    return Err(ProtocolError::InsufficientChannelValue {
                        offered: total_value,
                        minimum: self.config.min_channel_value,
                    }
                    .into());
                }
                if expiry_time != negotiation.expiry_time {
                    return Err(violation(format!(
                        "proposed expiry {expiry_time}, offered {}",
                        negotiation.expiry_time
                    )));
                }
                let contract = ChannelContract::new(
                    total_value,
                    expiry_time,
                    payer_key,
                    self.payee_key,
                    negotiation.version,
                )?
                .with_funding(funding);
                negotiation.ledger = Some(Ledger::new(contract, self.config.instrument_fee)?);
                debug!(total_value, %funding, "contract proposal accepted");

                self.lifecycle = if negotiation.version.cosigns_refund_at_open() {
                    ServerLifecycle::AwaitRefundForCosign
                } else {
                    ServerLifecycle::AwaitContractBroadcastConfirm
                };
                Ok(ServerStep::default())
            }
            Message::RefundUnsigned { refund }
                if self.lifecycle == ServerLifecycle::AwaitRefundForCosign =>
            {
                self.cosign_refund(&refund).await
            }
            Message::ContractFunded { contract }
                if self.lifecycle == ServerLifecycle::AwaitContractBroadcastConfirm =>
            {
                self.contract_funded(contract).await
            }
            Message::PaymentIncrement { amount, paid_so_far, settlement_signature, info }
                if self.lifecycle == ServerLifecycle::Open =>
            {
                self.apply_increment(amount, paid_so_far, &settlement_signature, info).await
            }
            Message::SettleRequest if self.lifecycle == ServerLifecycle::Open => {
                self.settle(CloseReason::ClientRequested).await
            }
            other => Err(self.unexpected(&other)),
        }
    }

    async fn try_resume(&mut self, channel_id: ChannelId) -> Result<Option<ServerStep>> {
        let now = self.now();
        let resumable = self
            .context
            .store
            .load(&channel_id)?
            .filter(|state| state.role == Role::Server && state.is_resumable(now));
        if resumable.is_none() {
            debug!(channel = %channel_id, "previous channel not resumable, negotiating a new one");
            return Ok(None);
        }

        let guard = self.context.store.try_lock(&channel_id)?;
        // Reload under the lock
        let Some(state) = self
            .context
            .store
            .load(&channel_id)?
            .filter(|state| state.is_resumable(now))
        else {
            return Ok(None);
        };
        if state.paid_so_far() < self.config.min_payment {
            debug!(
                channel = %channel_id,
                paid = state.paid_so_far(),
                "previous channel never made its initial payment"
            );
            return Ok(None);
        }
        if self.past_settle_deadline(&state) {
            info!(channel = %channel_id, expiry = state.expiry_time(), "resumed channel is expiring");
            self.guard = Some(guard);
            self.state = Some(state);
            self.lifecycle = ServerLifecycle::Open;
            return self.settle(CloseReason::ChannelExpired).await.map(Some);
        }

        info!(channel = %channel_id, paid = state.paid_so_far(), "channel resumed");
        self.handler.channel_open(channel_id, state.contract()).await;
        let ack = Message::ChannelOpenAck {
            channel_id,
            expiry_time: state.expiry_time(),
            paid_so_far: state.paid_so_far(),
        };
        self.guard = Some(guard);
        self.state = Some(state);
        self.lifecycle = ServerLifecycle::Open;
        Ok(Some(ServerStep::send(ack)))
    }

    fn select_version(&mut self, max_version: u32, time_window_secs: u64) -> Result<ServerStep> {
        let version = ProtocolVersion::negotiate(max_version, self.config.max_version)
            .ok_or(ProtocolError::UnsupportedVersion { requested: max_version })?;
        let (min, max) = (self.config.min_time_window_secs, self.config.max_time_window_secs);
        if !(min..=max).contains(&time_window_secs) {
            return Err(ProtocolError::TimeWindowUnacceptable {
                requested: time_window_secs,
                min,
                max,
            }
            .into());
        }

        let expiry_time = self.now() + time_window_secs;
        debug!(?version, expiry_time, "offering channel terms");
        self.negotiation = Some(Negotiation { version, expiry_time, ledger: None });
        self.lifecycle = ServerLifecycle::AwaitContractProposal;
        Ok(ServerStep::send(Message::VersionSelect {
            version: version.number(),
            payee_key: self.payee_key,
            min_channel_value: self.config.min_channel_value,
            min_payment: self.config.min_payment,
            instrument_fee: self.config.instrument_fee,
            expiry_time,
        }))
    }

    fn pending_ledger(&mut self) -> Result<&mut Ledger> {
        self.negotiation
            .as_mut()
            .and_then(|n| n.ledger.as_mut())
            .ok_or_else(|| violation("no contract under negotiation"))
    }

    async fn cosign_refund(&mut self, refund: &Transaction) -> Result<ServerStep> {
        let payee_key = self.payee_key;
        let ledger = self.pending_ledger()?;
        if refund.compute_txid() != ledger.refund().txid() {
            return Err(crate::errors::ChannelError::ContractMismatch(
                "refund does not return the contract to the payer".to_string(),
            )
            .into());
        }
        let digest = ledger.refund().sighash(ledger.contract())?;
        let signature = self.context.signer.sign(digest, &payee_key).await?;
        self.pending_ledger()?.sign_refund(Role::Server, signature)?;

        debug!("refund co-signed");
        self.lifecycle = ServerLifecycle::AwaitContractBroadcastConfirm;
        Ok(ServerStep::send(Message::RefundSigned {
            signature: signature.serialize_der().to_vec(),
        }))
    }

    async fn contract_funded(&mut self, funding_tx: Transaction) -> Result<ServerStep> {
        let ledger = self
            .negotiation
            .take()
            .and_then(|n| n.ledger)
            .ok_or_else(|| violation("no contract under negotiation"))?;
        ledger.contract().validate_funding(&funding_tx)?;

        let handle = self.context.broadcaster.broadcast(&funding_tx).await?;
        let depth = self.config.min_depth;
        if depth > 0 {
            debug!(txid = %handle.txid, depth, "waiting for contract confirmations");
            tokio::time::timeout(
                self.config.message_timeout(),
                self.context.broadcaster.await_depth(&handle, depth),
            )
            .await
            .map_err(|_| ProtocolError::TimedOut(format!("{depth} confirmations")))??;
        }

        let channel_id = ChannelId::from_contract(&handle.txid);
        self.guard = Some(self.context.store.try_lock(&channel_id)?);
        let state = ChannelState::new_server(channel_id, ledger, self.now());
        self.persist(&state)?;

        info!(
            channel = %channel_id,
            value = state.contract().total_value,
            expiry = state.expiry_time(),
            "channel open"
        );
        self.handler.channel_open(channel_id, state.contract()).await;
        let ack = Message::ChannelOpenAck {
            channel_id,
            expiry_time: state.expiry_time(),
            paid_so_far: 0,
        };
        self.state = Some(state);
        self.lifecycle = ServerLifecycle::Open;
        Ok(ServerStep::send(ack))
    }

    async fn apply_increment(
        &mut self,
        amount: Sats,
        paid_so_far: Sats,
        settlement_signature: &[u8],
        info: Option<Vec<u8>>,
    ) -> Result<ServerStep> {
        let state = self.state.as_ref().ok_or_else(|| violation("channel state missing"))?;
        if self.past_settle_deadline(state) {
            info!(
                expiry = state.expiry_time(),
                amount,
                "refusing payment on an expiring channel"
            );
            return self.settle(CloseReason::ChannelExpired).await;
        }
        if state.paid_so_far() == 0 && paid_so_far < self.config.min_payment {
            let reason =
                format!("first payment {paid_so_far} below minimum {}", self.config.min_payment);
            return Ok(ServerStep::send(Message::error(ErrorCode::PaymentRejected, reason)));
        }
        let proposal = state.ledger.propose_total(paid_so_far)?;
        let contract = state.contract().clone();
        if proposal.amount != amount {
            return Err(violation(format!(
                "increment of {amount} does not reach claimed total {paid_so_far}"
            )));
        }
        let settlement_payer = parse_signature(settlement_signature, "payer settlement")?;
        if let Err(e) = proposal.settlement.verify(&contract, Role::Client, &settlement_payer) {
            self.flag_for_review();
            return Err(e);
        }

        self.lifecycle = ServerLifecycle::ApplyIncrement;
        let reply_info = match self.handler.payment_increase(amount, paid_so_far, info).await {
            Ok(reply_info) => reply_info,
            Err(reason) => {
                info!(amount, paid = paid_so_far, %reason, "payment rejected by handler");
                self.lifecycle = ServerLifecycle::Open;
                return Ok(ServerStep::send(Message::error(ErrorCode::PaymentRejected, reason)));
            }
        };

        let settlement_digest = proposal.settlement.sighash(&contract)?;
        let settlement_payee = self.context.signer.sign(settlement_digest, &self.payee_key).await?;
        let refund_payee = if contract.version.countersigns_increments() {
            let refund_digest = proposal.refund.sighash(&contract)?;
            Some(self.context.signer.sign(refund_digest, &self.payee_key).await?)
        } else {
            None
        };
        let signatures = IncrementSignatures {
            settlement_payer: Some(settlement_payer),
            settlement_payee: Some(settlement_payee),
            refund_payer: None,
            refund_payee,
        };

        let mut state = self.state.take().ok_or_else(|| violation("channel state missing"))?;
        let accepted = state.ledger.accept_increment(proposal, signatures);
        if accepted.is_ok() {
            state.updated_at = self.now();
        }
        let result = accepted.and_then(|()| self.persist(&state));
        self.state = Some(state);
        self.lifecycle = ServerLifecycle::Open;
        result?;

        debug!(amount, paid = paid_so_far, "payment applied");
        Ok(ServerStep::send(Message::PaymentAck {
            refund_signature: refund_payee.map(|sig| sig.serialize_der().to_vec()),
            info: reply_info,
        }))
    }

    fn flag_for_review(&mut self) {
        let Some(mut state) = self.state.take() else {
            return;
        };
        state.needs_review = true;
        if let Err(e) = self.persist(&state) {
            warn!(error = %e, "failed to flag channel for review");
        }
        self.state = Some(state);
    }

    async fn broadcast_settlement(&mut self, reason: CloseReason) -> Result<Option<Transaction>> {
        let state = self.state.as_ref().ok_or_else(|| violation("channel state missing"))?;
        let settlement = match state.paid_so_far() {
            0 => None,
            _ => Some(state.ledger.settlement().finalize(state.contract())?),
        };

        self.lifecycle = ServerLifecycle::Closing;
        if let Some(tx) = &settlement {
            let txid = tx.compute_txid();
            let already = self.state.as_ref().is_some_and(|s| s.broadcast_txids.contains(&txid));
            if !already {
                if let Err(e) = self.context.broadcaster.broadcast(tx).await {
                    self.lifecycle = ServerLifecycle::Open;
                    return Err(e);
                }
            }
        }

        let now = self.now();
        let mut state = self.state.take().ok_or_else(|| violation("channel state missing"))?;
        match &settlement {
            Some(tx) => {
                state.record_broadcast(tx.compute_txid());
                info!(
                    channel = %state.channel_id,
                    txid = %tx.compute_txid(),
                    paid = state.paid_so_far(),
                    "settlement broadcast"
                );
            }
            None => info!(channel = %state.channel_id, "closing channel with nothing paid"),
        }
        state.mark_closed(reason, now);
        let persisted = self.persist(&state);
        self.state = Some(state);
        self.lifecycle = ServerLifecycle::Closed;
        self.close_reason = Some(reason);
        persisted?;
        Ok(settlement)
    }

    async fn settle(&mut self, reason: CloseReason) -> Result<ServerStep> {
        let message = match self.broadcast_settlement(reason).await? {
            Some(settlement) => Message::SettleInstrument { settlement, reason },
            None => Message::Close { reason },
        };
        Ok(ServerStep::finish(vec![message]))
    }

    /// Settles the channel on the payee's initiative
    ///
    /// # Errors
    /// * `ProtocolError::NotOpen` - If the channel is not open and idle
    pub async fn close(&mut self) -> Result<ServerStep> {
        if self.lifecycle != ServerLifecycle::Open {
            return Err(ProtocolError::NotOpen(self.lifecycle.to_string()).into());
        }
        self.settle(CloseReason::ServerRequested).await
    }

    /// Settles an open channel that reached the settle margin before expiry
    ///
    /// # Errors
    /// * `ProtocolError::NotOpen` - If the channel is not open and idle
    pub async fn expire(&mut self) -> Result<ServerStep> {
        if self.lifecycle != ServerLifecycle::Open {
            return Err(ProtocolError::NotOpen(self.lifecycle.to_string()).into());
        }
        info!("channel reached its settle deadline");
        self.settle(CloseReason::ChannelExpired).await
    }

    /// Reacts to the client going quiet on an open channel
    ///
    /// Broadcasts the latest settlement and hands it to the client when
    /// `unilateral_close_on_timeout` is set, otherwise only closes the
    /// session and leaves the channel open for resumption.
    pub async fn inactivity_timeout(&mut self) -> Result<ServerStep> {
        self.close_reason = Some(CloseReason::Timeout);
        if self.lifecycle != ServerLifecycle::Open || !self.config.unilateral_close_on_timeout {
            return Ok(ServerStep::finish(vec![Message::Close { reason: CloseReason::Timeout }]));
        }
        warn!("client inactive, settling unilaterally");
        self.settle(CloseReason::Timeout).await
    }

    /// Ends the session, releasing the channel and notifying the handler
    pub async fn disconnect(&mut self, error: Option<ErrorKind>) {
        let reason = self.close_reason.unwrap_or(match error {
            None => CloseReason::ConnectionClosed,
            Some(ErrorKind::TimedOut) => CloseReason::Timeout,
            Some(_) => CloseReason::ProtocolViolation,
        });
        if self.lifecycle != ServerLifecycle::Closed {
            self.lifecycle = ServerLifecycle::Disconnected;
        }
        self.guard = None;
        self.negotiation = None;
        debug!(?reason, "server session ended");
        self.handler.channel_closed(reason).await;
    }
}
