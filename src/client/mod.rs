//! Payer-side state machine
//!
//! [`ClientStateMachine`] owns the payer's view of one channel. It performs
//! no I/O itself: the session driver in [`connection`] feeds it server
//! messages and local requests and writes out whatever it returns.
//!
//! States: `Initiate → WaitingForContractAccept → WaitingForRefundSig →
//! WaitingForChannelOpen → Open → (Incrementing)* → Settling | Disconnected
//! → Closed`. `WaitingForRefundSig` is skipped by versions that do not
//! co-sign the refund at open, and a resumed channel goes straight from
//! `WaitingForContractAccept` to `Open`.
//!
//! The store keeps one live record per server. A record that can no longer
//! be resumed is set aside under the server's channel id before a new
//! channel is negotiated, so the sweep still refunds its contract.

pub mod connection;

use std::fmt;
use std::sync::Arc;

use bitcoin::{PublicKey, Transaction};
use tracing::{debug, info, warn};

pub use connection::{ClientConnection, ClientHandle, PaymentReceipt};

use crate::channel::instrument::parse_signature;
use crate::channel::ledger::{IncrementProposal, IncrementSignatures, Ledger};
use crate::channel::state::{ChannelLifecycle, ChannelState};
use crate::channel::ChannelContract;
use crate::config::{ClientConfig, EXPIRY_TOLERANCE_SECS};
use crate::errors::{Error, ErrorKind, ProtocolError, Result, StoreError};
use crate::protocol::messages::{CloseReason, ErrorCode, Message};
use crate::protocol::version::ProtocolVersion;
use crate::services::{Broadcaster, Funds, Signer};
use crate::store::{ChannelGuard, ChannelStore};
use crate::types::{ChannelId, Role, Sats, Timestamp};

/// Lifecycle of the payer's session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientLifecycle {
    /// Nothing sent yet
    Initiate,
    /// `CLIENT_VERSION` sent, waiting for terms or a resume acknowledgement
    WaitingForContractAccept,
    /// Contract proposed, waiting for the payee's refund signature
    WaitingForRefundSig,
    /// Contract funded, waiting for `CHANNEL_OPEN_ACK`
    WaitingForChannelOpen,
    /// Channel open, no increment in flight
    Open,
    /// An increment is waiting for `PAYMENT_ACK`
    Incrementing,
    /// Settlement requested
    Settling,
    /// Session ended with the channel still open
    Disconnected,
    /// Channel settled
    Closed,
}

impl fmt::Display for ClientLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{self:?}") }
}

/// Collaborators the payer needs
#[derive(Clone)]
pub struct ClientContext {
    /// Holds the payer key
    pub signer: Arc<dyn Signer>,
    /// Publishes the contract
    pub broadcaster: Arc<dyn Broadcaster>,
    /// Funds the contract
    pub funds: Arc<dyn Funds>,
    /// Persists the channel
    pub store: Arc<ChannelStore>,
}

/// Something the driver should report to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The channel is open
    Opened {
        /// Whether an existing channel was resumed
        resumed: bool,
    },
    /// An increment was acknowledged and committed
    PaymentAcked(PaymentReceipt),
    /// The payee refused an increment; the channel stays open
    PaymentRejected(String),
    /// The channel settled on-chain
    Settled {
        /// Settlement the payee broadcast
        settlement: Transaction,
        /// Why the channel closed
        reason: CloseReason,
    },
}

/// Result of feeding one input to the state machine
#[derive(Debug, Default)]
pub struct ClientStep {
    /// Messages to send, in order
    pub outbound: Vec<Message>,
    /// Outcome to report, if any
    pub event: Option<ClientEvent>,
}

impl ClientStep {
    fn send(message: Message) -> Self { Self { outbound: vec![message], event: None } }

    fn event(event: ClientEvent) -> Self { Self { outbound: Vec::new(), event: Some(event) } }
}

/// Read-only view of the session for callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSnapshot {
    /// Session lifecycle
    pub lifecycle: ClientLifecycle,
    /// Local channel id
    pub channel_id: ChannelId,
    /// The server's channel id, once known
    pub server_channel_id: Option<ChannelId>,
    /// Amount paid so far
    pub paid_so_far: Sats,
    /// Channel value, once agreed
    pub total_value: Option<Sats>,
    /// Contract expiry, once agreed
    pub expiry_time: Option<Timestamp>,
}

struct Negotiation {
    ledger: Ledger,
    funding_tx: Transaction,
    broadcast: bool,
    min_payment: Sats,
}

struct PendingIncrement {
    proposal: IncrementProposal,
    signatures: IncrementSignatures,
    initial: bool,
}

/// Payer-side protocol state machine for one server
pub struct ClientStateMachine {
    config: ClientConfig,
    context: ClientContext,
    server_id: String,
    channel_id: ChannelId,
    payer_key: PublicKey,
    channel_value: Sats,
    lifecycle: ClientLifecycle,
    guard: Option<ChannelGuard>,
    resuming: Option<ChannelState>,
    negotiation: Option<Negotiation>,
    state: Option<ChannelState>,
    pending: Option<PendingIncrement>,
}

fn violation(reason: impl Into<String>) -> Error { ProtocolError::Violation(reason.into()).into() }

impl ClientStateMachine {
    /// Creates a machine that opens or resumes a channel of `channel_value` with `server_id`
    pub fn new(
        config: ClientConfig,
        context: ClientContext,
        server_id: impl Into<String>,
        payer_key: PublicKey,
        channel_value: Sats,
    ) -> Self {
        let server_id = server_id.into();
        Self {
            config,
            context,
            channel_id: ChannelId::for_server(&server_id),
            server_id,
            payer_key,
            channel_value,
            lifecycle: ClientLifecycle::Initiate,
            guard: None,
            resuming: None,
            negotiation: None,
            state: None,
            pending: None,
        }
    }

    /// Current lifecycle
    pub fn lifecycle(&self) -> ClientLifecycle { self.lifecycle }

    /// Client configuration
    pub fn config(&self) -> &ClientConfig { &self.config }

    /// Channel state once open
    pub fn state(&self) -> Option<&ChannelState> { self.state.as_ref() }

    /// Snapshot for callers
    pub fn snapshot(&self) -> ClientSnapshot {
        let state = self.state.as_ref().or(self.resuming.as_ref());
        let contract = state
            .map(|s| s.contract())
            .or_else(|| self.negotiation.as_ref().map(|n| n.ledger.contract()));
        ClientSnapshot {
            lifecycle: self.lifecycle,
            channel_id: self.channel_id,
            server_channel_id: state.and_then(|s| s.remote_channel_id),
            paid_so_far: state.map(|s| s.paid_so_far()).unwrap_or(0),
            total_value: contract.map(|c| c.total_value),
            expiry_time: contract.map(|c| c.expiry_time),
        }
    }

    fn now(&self) -> Timestamp { self.context.store.now() }

    fn unexpected(&self, message: &Message) -> Error {
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

    /// Moves `stale` out of this server's slot, keeping it under the server's channel id
    fn set_aside(&self, mut stale: ChannelState) -> Result<()> {
        let guard = self.guard.as_ref().ok_or(StoreError::LockNotHeld(self.channel_id))?;
        let server_channel = stale
            .remote_channel_id
            .ok_or_else(|| violation("stored channel has no server channel id"))?;
        let aside = self.context.store.try_lock(&server_channel)?;
        stale.channel_id = server_channel;
        stale.updated_at = self.now();
        self.context.store.persist(&aside, &stale)?;
        self.context.store.remove(guard)?;
        warn!(
            channel = %self.channel_id,
            %server_channel,
            paid = stale.paid_so_far(),
            needs_review = stale.needs_review,
            "set aside channel that cannot be resumed"
        );
        Ok(())
    }

    /// Locks the channel slot and produces `CLIENT_VERSION`
    ///
    /// A stored, unexpired channel with this server is offered for resumption.
    /// Any other unfinished record is set aside first.
    ///
    /// # Errors
    /// * `StoreError::ChannelBusy` - If another session uses this server's channel
    pub fn start(&mut self) -> Result<Message> {
        if self.lifecycle != ClientLifecycle::Initiate {
            return Err(ProtocolError::NotOpen(self.lifecycle.to_string()).into());
        }
        self.guard = Some(self.context.store.try_lock(&self.channel_id)?);

        let now = self.now();
        self.resuming = self
            .context
            .store
            .find_resumable(&self.server_id, now)?
            .filter(|state| state.remote_channel_id.is_some());
        if self.resuming.is_none() {
            let stale = self
                .context
                .store
                .load(&self.channel_id)?
                .filter(|state| state.role == Role::Client && !state.is_closed());
            if let Some(stale) = stale {
                self.set_aside(stale)?;
            }
        }
        let previous_channel = self.resuming.as_ref().and_then(|state| state.remote_channel_id);
        match &self.resuming {
            Some(state) => info!(
                channel = %self.channel_id,
                paid = state.paid_so_far(),
                "attempting to resume channel"
            ),
            None => info!(channel = %self.channel_id, value = self.channel_value, "opening new channel"),
        }

        self.lifecycle = ClientLifecycle::WaitingForContractAccept;
        Ok(Message::ClientVersion {
            max_version: self.config.max_version,
            previous_channel,
            time_window_secs: self.config.time_window_secs,
        })
    }

    /// Feeds one server message to the machine
    ///
    /// # Errors
    /// Any error ends the session; persisted state is left at its last good value.
    pub async fn receive(&mut self, message: Message) -> Result<ClientStep> {
        match message {
            Message::Error { code, explanation } => {
                if code == ErrorCode::PaymentRejected && self.pending.is_some() {
                    return self.payment_rejected(explanation);
                }
                warn!(?code, %explanation, "server reported an error");
                Err(ProtocolError::Remote { code, explanation }.into())
            }
            Message::Close { reason } => {
                if matches!(self.lifecycle, ClientLifecycle::Open | ClientLifecycle::Incrementing) {
                    self.lifecycle = ClientLifecycle::Disconnected;
                }
                Err(ProtocolError::RemoteClosed(reason).into())
            }
            Message::VersionSelect {
                version,
                payee_key,
                min_channel_value,
                min_payment,
                instrument_fee,
                expiry_time,
            } if self.lifecycle == ClientLifecycle::WaitingForContractAccept => {
                let terms = OfferedTerms {
                    version,
                    payee_key,
                    min_channel_value,
                    min_payment,
                    instrument_fee,
                    expiry_time,
                };
                self.accept_terms(terms).await
            }
            Message::RefundSigned { signature }
                if self.lifecycle == ClientLifecycle::WaitingForRefundSig =>
            {
                self.refund_signed(&signature).await
            }
            Message::ChannelOpenAck { channel_id, expiry_time, paid_so_far } => {
                match self.lifecycle {
                    ClientLifecycle::WaitingForContractAccept if self.resuming.is_some() => {
                        self.resumed(channel_id, expiry_time, paid_so_far)
                    }
                    ClientLifecycle::WaitingForChannelOpen => {
                        self.opened(channel_id, expiry_time, paid_so_far).await
                    }
                    _ => Err(self.unexpected(&Message::ChannelOpenAck {
                        channel_id,
                        expiry_time,
                        paid_so_far,
                    })),
                }
            }
            Message::PaymentAck { refund_signature, info }
                if self.lifecycle == ClientLifecycle::Incrementing =>
            {
                self.payment_acked(refund_signature, info)
            }
            // The server may also settle on its own initiative
            Message::SettleInstrument { settlement, reason } if self.accepts_settlement() => {
                if self.state.is_none() {
                    self.state = self.resuming.take();
                }
                self.settled(settlement, reason)
            }
            other => Err(self.unexpected(&other)),
        }
    }

    fn accepts_settlement(&self) -> bool {
        match self.lifecycle {
            ClientLifecycle::Open | ClientLifecycle::Incrementing | ClientLifecycle::Settling => true,
            ClientLifecycle::WaitingForContractAccept => self.resuming.is_some(),
            _ => false,
        }
    }

    async fn accept_terms(&mut self, terms: OfferedTerms) -> Result<ClientStep> {
        if let Some(mut refused) = self.resuming.take() {
            warn!(
                channel = %self.channel_id,
                paid = refused.paid_so_far(),
                "server refused to resume channel, negotiating a new one"
            );
            refused.needs_review = true;
            self.set_aside(refused)?;
        }
        let version = ProtocolVersion::from_number(terms.version)
            .filter(|v| v.number() <= self.config.max_version)
            .ok_or(ProtocolError::UnsupportedVersion { requested: terms.version })?;
        if terms.min_channel_value > self.channel_value || terms.min_payment > self.channel_value {
            return Err(ProtocolError::InsufficientChannelValue {
                offered: self.channel_value,
                minimum: terms.min_channel_value.max(terms.min_payment),
            }
            .into());
        }
        if terms.instrument_fee > self.config.max_instrument_fee {
            return Err(violation(format!(
                "instrument fee {} above maximum {}",
                terms.instrument_fee, self.config.max_instrument_fee
            )));
        }
        let now = self.now();
        let latest_expiry = now + self.config.time_window_secs + EXPIRY_TOLERANCE_SECS;
        if terms.expiry_time <= now || terms.expiry_time > latest_expiry {
            return Err(violation(format!("expiry {} outside requested window", terms.expiry_time)));
        }

        let contract = ChannelContract::new(
            self.channel_value,
            terms.expiry_time,
            self.payer_key,
            terms.payee_key,
            version,
        )?;
        let funding_tx = self.context.funds.fund(contract.txout()).await?;
        let negotiated = self.prepare_ledger(contract, &funding_tx, terms.instrument_fee).await;
        let ledger = match negotiated {
            Ok(ledger) => ledger,
            Err(e) => {
                self.context.funds.release(&funding_tx).await?;
                return Err(e);
            }
        };

        let contract = ledger.contract().clone();
        let funding = contract.funding_outpoint()?;
        debug!(?version, %funding, "contract funded, proposing");
        self.negotiation =
            Some(Negotiation { ledger, funding_tx, broadcast: false, min_payment: terms.min_payment });

        let proposal = Message::ContractProposal {
            total_value: contract.total_value,
            expiry_time: contract.expiry_time,
            payer_key: self.payer_key,
            funding,
        };
        if version.cosigns_refund_at_open() {
            let refund = self.negotiation_ref()?.ledger.refund().tx.clone();
            self.lifecycle = ClientLifecycle::WaitingForRefundSig;
            Ok(ClientStep {
                outbound: vec![proposal, Message::RefundUnsigned { refund }],
                event: None,
            })
        } else {
            let funded = self.broadcast_contract().await?;
            self.lifecycle = ClientLifecycle::WaitingForChannelOpen;
            Ok(ClientStep { outbound: vec![proposal, funded], event: None })
        }
    }

    async fn prepare_ledger(
        &self,
        contract: ChannelContract,
        funding_tx: &Transaction,
        instrument_fee: Sats,
    ) -> Result<Ledger> {
        let outpoint = contract.locate_output(funding_tx)?;
        let mut ledger = Ledger::new(contract.with_funding(outpoint), instrument_fee)?;
        let digest = ledger.refund().sighash(ledger.contract())?;
        let signature = self.context.signer.sign(digest, &self.payer_key).await?;
        ledger.sign_refund(Role::Client, signature)?;
        Ok(ledger)
    }

    fn negotiation_ref(&self) -> Result<&Negotiation> {
        self.negotiation.as_ref().ok_or_else(|| violation("no contract under negotiation"))
    }

    async fn broadcast_contract(&mut self) -> Result<Message> {
        let negotiation =
            self.negotiation.as_mut().ok_or_else(|| violation("no contract under negotiation"))?;
        let handle = self.context.broadcaster.broadcast(&negotiation.funding_tx).await?;
        negotiation.broadcast = true;
        info!(txid = %handle.txid, "contract broadcast");
        Ok(Message::ContractFunded { contract: negotiation.funding_tx.clone() })
    }

    async fn refund_signed(&mut self, signature: &[u8]) -> Result<ClientStep> {
        let signature = parse_signature(signature, "payee refund")?;
        let negotiation =
            self.negotiation.as_mut().ok_or_else(|| violation("no contract under negotiation"))?;
        negotiation.ledger.sign_refund(Role::Server, signature)?;
        let funded = self.broadcast_contract().await?;
        self.lifecycle = ClientLifecycle::WaitingForChannelOpen;
        Ok(ClientStep::send(funded))
    }

    fn resumed(
        &mut self,
        channel_id: ChannelId,
        expiry_time: Timestamp,
        paid_so_far: Sats,
    ) -> Result<ClientStep> {
        let state = self.resuming.take().ok_or_else(|| violation("nothing to resume"))?;
        if state.remote_channel_id != Some(channel_id)
            || state.expiry_time() != expiry_time
            || state.paid_so_far() != paid_so_far
        {
            return Err(violation(format!(
                "resume mismatch: server reports {paid_so_far} paid, local {}",
                state.paid_so_far()
            )));
        }
        info!(channel = %self.channel_id, paid = paid_so_far, "channel resumed");
        self.state = Some(state);
        self.lifecycle = ClientLifecycle::Open;
        Ok(ClientStep::event(ClientEvent::Opened { resumed: true }))
    }

    async fn opened(
        &mut self,
        channel_id: ChannelId,
        expiry_time: Timestamp,
        paid_so_far: Sats,
    ) -> Result<ClientStep> {
        let negotiation =
            self.negotiation.take().ok_or_else(|| violation("no contract under negotiation"))?;
        if negotiation.ledger.contract().expiry_time != expiry_time || paid_so_far != 0 {
            return Err(violation("channel open acknowledgement does not match the contract"));
        }
        let mut state =
            ChannelState::new_client(&self.server_id, channel_id, negotiation.ledger, self.now());
        if negotiation.min_payment > 0 {
            state.lifecycle = ChannelLifecycle::Opening;
        }
        self.persist(&state)?;
        info!(channel = %self.channel_id, server_channel = %channel_id, "channel open");
        self.state = Some(state);
        self.lifecycle = ClientLifecycle::Open;

        if negotiation.min_payment > 0 {
            let message = self.start_increment(negotiation.min_payment, None, true).await?;
            return Ok(ClientStep::send(message));
        }
        Ok(ClientStep::event(ClientEvent::Opened { resumed: false }))
    }

    /// Starts an increment of `amount`, producing `PAYMENT_INCREMENT`
    ///
    /// # Errors
    /// * `ProtocolError::ConcurrentPaymentInProgress` - If an increment is in flight
    /// * `ProtocolError::NotOpen` - If the channel is not open
    /// * `ChannelError::ValueOutOfRange` - If the channel cannot cover `amount`
    pub async fn begin_increment(&mut self, amount: Sats, info: Option<Vec<u8>>) -> Result<Message> {
        self.start_increment(amount, info, false).await
    }

    async fn start_increment(
        &mut self,
        amount: Sats,
        info: Option<Vec<u8>>,
        initial: bool,
    ) -> Result<Message> {
        match self.lifecycle {
            ClientLifecycle::Open => {}
            ClientLifecycle::Incrementing => {
                return Err(ProtocolError::ConcurrentPaymentInProgress.into())
            }
            other => return Err(ProtocolError::NotOpen(other.to_string()).into()),
        }
        let state = self.state.as_ref().ok_or_else(|| violation("channel state missing"))?;
        if state.contract().is_expired(self.now()) {
            return Err(ProtocolError::ChannelExpired { expiry: state.expiry_time() }.into());
        }
        let proposal = state.ledger.propose_increment(amount)?;
        let contract = state.contract();

        let settlement_digest = proposal.settlement.sighash(contract)?;
        let refund_digest = proposal.refund.sighash(contract)?;
        let settlement_payer = self.context.signer.sign(settlement_digest, &self.payer_key).await?;
        let refund_payer = self.context.signer.sign(refund_digest, &self.payer_key).await?;

        let message = Message::PaymentIncrement {
            amount,
            paid_so_far: proposal.paid_so_far,
            settlement_signature: settlement_payer.serialize_der().to_vec(),
            info,
        };
        debug!(amount, paid = proposal.paid_so_far, "sending payment increment");
        self.pending = Some(PendingIncrement {
            proposal,
            signatures: IncrementSignatures {
                settlement_payer: Some(settlement_payer),
                refund_payer: Some(refund_payer),
                ..IncrementSignatures::default()
            },
            initial,
        });
        self.lifecycle = ClientLifecycle::Incrementing;
        Ok(message)
    }

    fn payment_acked(
        &mut self,
        refund_signature: Option<Vec<u8>>,
        info: Option<Vec<u8>>,
    ) -> Result<ClientStep> {
        let pending = self.pending.take().ok_or_else(|| violation("no increment in flight"))?;
        let mut signatures = pending.signatures;
        if let Some(bytes) = refund_signature {
            signatures.refund_payee = Some(parse_signature(&bytes, "payee refund")?);
        }
        let amount = pending.proposal.amount;

        let mut state = self.state.take().ok_or_else(|| violation("channel state missing"))?;
        if let Err(e) = state.ledger.accept_increment(pending.proposal, signatures) {
            if e.kind() == ErrorKind::InvalidSignature {
                state.needs_review = true;
                // Best effort: the session is aborting anyway
                if let Err(persist_error) = self.persist(&state) {
                    warn!(error = %persist_error, "failed to flag channel for review");
                }
            }
            self.state = Some(state);
            return Err(e);
        }
        state.updated_at = self.now();
        if pending.initial {
            state.lifecycle = ChannelLifecycle::Open;
        }
        let persisted = self.persist(&state);
        let paid_so_far = state.paid_so_far();
        self.state = Some(state);
        persisted?;

        self.lifecycle = ClientLifecycle::Open;
        debug!(amount, paid = paid_so_far, "payment acknowledged");
        if pending.initial {
            return Ok(ClientStep::event(ClientEvent::Opened { resumed: false }));
        }
        Ok(ClientStep::event(ClientEvent::PaymentAcked(PaymentReceipt { amount, paid_so_far, info })))
    }

    fn payment_rejected(&mut self, explanation: String) -> Result<ClientStep> {
        let pending = self.pending.take();
        self.lifecycle = ClientLifecycle::Open;
        warn!(%explanation, "server rejected payment increment");
        if pending.is_some_and(|p| p.initial) {
            if let Some(mut state) = self.state.take() {
                state.needs_review = true;
                if let Err(e) = self.persist(&state) {
                    warn!(error = %e, "failed to flag channel for review");
                }
                self.state = Some(state);
            }
            return Err(ProtocolError::PaymentRejected(explanation).into());
        }
        Ok(ClientStep::event(ClientEvent::PaymentRejected(explanation)))
    }

    /// Requests cooperative settlement, producing `SETTLE_REQUEST`
    pub fn begin_settle(&mut self) -> Result<Message> {
        match self.lifecycle {
            ClientLifecycle::Open => {
                self.lifecycle = ClientLifecycle::Settling;
                info!(channel = %self.channel_id, "requesting settlement");
                Ok(Message::SettleRequest)
            }
            ClientLifecycle::Incrementing => Err(ProtocolError::ConcurrentPaymentInProgress.into()),
            other => Err(ProtocolError::NotOpen(other.to_string()).into()),
        }
    }

    fn settled(&mut self, settlement: Transaction, reason: CloseReason) -> Result<ClientStep> {
        let mut state = self.state.take().ok_or_else(|| violation("channel state missing"))?;
        let expected = state.ledger.settlement();
        if settlement.compute_txid() != expected.txid() || settlement.output != expected.tx.output {
            let paid = state.paid_so_far();
            self.state = Some(state);
            return Err(violation(format!("settlement does not match the {paid} paid")));
        }
        state.record_broadcast(settlement.compute_txid());
        state.mark_closed(reason, self.now());
        let persisted = self.persist(&state);
        info!(channel = %self.channel_id, paid = state.paid_so_far(), ?reason, "channel settled");
        self.state = Some(state);
        self.pending = None;
        persisted?;
        self.lifecycle = ClientLifecycle::Closed;
        Ok(ClientStep::event(ClientEvent::Settled { settlement, reason }))
    }

    /// Ends the session without closing the channel
    ///
    /// Stored state stays open for a later resume. A contract that was
    /// funded but never broadcast is returned to the wallet.
    pub async fn disconnect(&mut self) {
        if let Some(negotiation) = self.negotiation.take() {
            if !negotiation.broadcast {
                if let Err(e) = self.context.funds.release(&negotiation.funding_tx).await {
                    warn!(error = %e, "failed to release unbroadcast contract funding");
                }
            }
        }
        self.pending = None;
        if self.lifecycle != ClientLifecycle::Closed {
            self.lifecycle = ClientLifecycle::Disconnected;
        }
        self.guard = None;
        debug!(channel = %self.channel_id, "session disconnected");
    }
}

struct OfferedTerms {
    version: u32,
    payee_key: PublicKey,
    min_channel_value: Sats,
    min_payment: Sats,
    instrument_fee: Sats,
    expiry_time: Timestamp,
}
