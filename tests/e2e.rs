//! End-to-end tests: a payer and a payee talking over an in-memory stream,
//! sharing a clock, a broadcaster and a signer

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::{Network, PublicKey};
use paychan::channel::ChannelLifecycle;
use paychan::client::{ClientContext, ClientLifecycle};
use paychan::errors::ProtocolError;
use paychan::server::{AcceptAll, CloseHandle, HandlerFactory, ServerConnection, ServerLifecycle};
use paychan::services::{
    Broadcaster, Clock, Funds, InMemorySigner, ManualClock, MemoryBroadcaster, MemoryFunds, Signer,
};
use paychan::store::StoreBackend;
use paychan::{
    serve_connection, ChannelId, ChannelState, ChannelStore, ClientConfig, ClientConnection,
    ClientHandle, ClientStateMachine, CloseReason, Error, ErrorCode, ErrorKind, FileBackend,
    MemoryBackend, ProtocolVersion, Sats, ServerConfig, ServerContext, ServerEventHandler,
    ServerListener, ServerStateMachine, StoreConfig,
};
use tokio::task::JoinHandle;

const NOW: u64 = 1_700_000_000;
const SERVER_ID: &str = "payee.example:4242";
const WALLET: Sats = 1_000_000;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

type ServerTask = JoinHandle<paychan::Result<ServerLifecycle>>;

struct Harness {
    clock: Arc<ManualClock>,
    broadcaster: Arc<MemoryBroadcaster>,
    signer: Arc<InMemorySigner>,
    funds: Arc<MemoryFunds>,
    client_store: Arc<ChannelStore>,
    server_store: Arc<ChannelStore>,
    payer_key: PublicKey,
    payee_key: PublicKey,
}

impl Harness {
    fn new() -> Self { Self::with_client_backend(Arc::new(MemoryBackend::new())) }

    fn with_client_backend(backend: Arc<dyn StoreBackend>) -> Self {
        init_tracing();
        let clock = Arc::new(ManualClock::new(NOW));
        let broadcaster = Arc::new(MemoryBroadcaster::new());
        let signer = Arc::new(InMemorySigner::new());
        let payer_key = signer.generate_key();
        let payee_key = signer.generate_key();
        let client_store = Self::store(&clock, &broadcaster, backend);
        let server_store = Self::store(&clock, &broadcaster, Arc::new(MemoryBackend::new()));
        Self {
            clock,
            broadcaster,
            signer,
            funds: Arc::new(MemoryFunds::new(WALLET)),
            client_store,
            server_store,
            payer_key,
            payee_key,
        }
    }

    fn store(
        clock: &Arc<ManualClock>,
        broadcaster: &Arc<MemoryBroadcaster>,
        backend: Arc<dyn StoreBackend>,
    ) -> Arc<ChannelStore> {
        Arc::new(ChannelStore::new(
            backend,
            Arc::clone(broadcaster) as Arc<dyn Broadcaster>,
            Arc::clone(clock) as Arc<dyn Clock>,
            StoreConfig { refund_grace_secs: 300, settle_margin_secs: 3_600, sweep_interval_secs: 60 },
        ))
    }

    fn client_config(&self) -> ClientConfig { ClientConfig::for_network(Network::Regtest) }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            min_channel_value: 100,
            min_payment: 0,
            instrument_fee: 0,
            ..ServerConfig::for_network(Network::Regtest)
        }
    }

    fn client(&self, config: ClientConfig, value: Sats) -> ClientStateMachine {
        self.client_with_signer(config, value, Arc::clone(&self.signer) as Arc<dyn Signer>)
    }

    fn client_with_signer(
        &self,
        config: ClientConfig,
        value: Sats,
        signer: Arc<dyn Signer>,
    ) -> ClientStateMachine {
        let context = ClientContext {
            signer,
            broadcaster: Arc::clone(&self.broadcaster) as Arc<dyn Broadcaster>,
            funds: Arc::clone(&self.funds) as Arc<dyn Funds>,
            store: Arc::clone(&self.client_store),
        };
        ClientStateMachine::new(config, context, SERVER_ID, self.payer_key, value)
    }

    fn server_context(&self) -> ServerContext {
        ServerContext {
            signer: Arc::clone(&self.signer) as Arc<dyn Signer>,
            broadcaster: Arc::clone(&self.broadcaster) as Arc<dyn Broadcaster>,
            store: Arc::clone(&self.server_store),
        }
    }

    fn server(&self, config: ServerConfig, handler: Arc<dyn ServerEventHandler>) -> ServerStateMachine {
        ServerStateMachine::new(config, self.server_context(), self.payee_key, handler)
    }

    async fn connect_with(
        &self,
        client: ClientConfig,
        server: ServerConfig,
        handler: Arc<dyn ServerEventHandler>,
        value: Sats,
    ) -> (paychan::Result<ClientHandle>, ServerTask) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server_task = tokio::spawn(serve_connection(server_io, self.server(server, handler)));
        let handle = ClientConnection::open(client_io, self.client(client, value)).await;
        (handle, server_task)
    }

    async fn connect(&self, value: Sats) -> Result<(ClientHandle, ServerTask)> {
        let (handle, task) = self
            .connect_with(self.client_config(), self.server_config(), Arc::new(AcceptAll), value)
            .await;
        Ok((handle?, task))
    }

    fn server_state(&self, handle: &ClientHandle) -> Result<ChannelState> {
        let channel_id =
            handle.state().server_channel_id.ok_or_else(|| anyhow!("no server channel id"))?;
        self.server_store.load(&channel_id)?.ok_or_else(|| anyhow!("server state missing"))
    }

    fn client_state(&self) -> Result<ChannelState> {
        self.client_store
            .load(&ChannelId::for_server(SERVER_ID))?
            .ok_or_else(|| anyhow!("client state missing"))
    }
}

/// Rejects increments larger than a limit and echoes a receipt otherwise
struct Limit(Sats);

#[async_trait]
impl ServerEventHandler for Limit {
    async fn payment_increase(
        &self,
        delta: Sats,
        total: Sats,
        _info: Option<Vec<u8>>,
    ) -> std::result::Result<Option<Vec<u8>>, String> {
        if delta > self.0 {
            return Err(format!("increment {delta} above limit {}", self.0));
        }
        Ok(Some(format!("total {total}").into_bytes()))
    }
}

/// Takes a while to approve each increment
struct Slow;

#[async_trait]
impl ServerEventHandler for Slow {
    async fn payment_increase(
        &self,
        _delta: Sats,
        _total: Sats,
        _info: Option<Vec<u8>>,
    ) -> std::result::Result<Option<Vec<u8>>, String> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(None)
    }
}

/// Records every close reason it is told about
#[derive(Default)]
struct Recorder(Mutex<Vec<CloseReason>>);

#[async_trait]
impl ServerEventHandler for Recorder {
    async fn channel_closed(&self, reason: CloseReason) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).push(reason);
    }
}

/// Signs with a stray key once told to
struct Forger {
    inner: Arc<InMemorySigner>,
    stray: PublicKey,
    forging: AtomicBool,
}

impl Forger {
    fn new(inner: Arc<InMemorySigner>) -> Self {
        let stray = inner.generate_key();
        Self { inner, stray, forging: AtomicBool::new(false) }
    }
}

#[async_trait]
impl Signer for Forger {
    async fn sign(&self, digest: [u8; 32], key: &PublicKey) -> paychan::Result<Signature> {
        let key = if self.forging.load(Ordering::SeqCst) { &self.stray } else { key };
        self.inner.sign(digest, key).await
    }
}

#[tokio::test]
async fn test_five_increments_of_ten() -> Result<()> {
    let h = Harness::new();
    let (client, _server) = h.connect(100).await?;
    assert_eq!(client.state().lifecycle, ClientLifecycle::Open);
    assert_eq!(h.funds.balance(), WALLET - 100);

    for expected in [10, 20, 30, 40, 50] {
        let receipt = client.increment_payment(10).await?;
        assert_eq!(receipt.amount, 10);
        assert_eq!(receipt.paid_so_far, expected);
        assert_eq!(h.server_state(&client)?.paid_so_far(), expected);
    }

    let server = h.server_state(&client)?;
    assert_eq!(server.lifecycle, ChannelLifecycle::Open);
    assert_eq!(server.paid_so_far(), 50);
    assert_eq!(h.client_state()?.paid_so_far(), 50);
    assert_eq!(client.state().paid_so_far, 50);
    Ok(())
}

#[tokio::test]
async fn test_increment_past_channel_value_rejected() -> Result<()> {
    let h = Harness::new();
    let (client, _server) = h.connect(100).await?;
    for _ in 0..9 {
        client.increment_payment(10).await?;
    }
    client.increment_payment(5).await?;
    assert_eq!(client.state().paid_so_far, 95);

    let err = client.increment_payment(10).await.expect_err("105 > 100");
    assert_eq!(err.kind(), ErrorKind::ValueOutOfRange);
    assert_eq!(client.state().paid_so_far, 95);
    assert_eq!(client.state().lifecycle, ClientLifecycle::Open);
    assert_eq!(h.server_state(&client)?.paid_so_far(), 95);

    // The channel is still usable up to its value
    assert_eq!(client.increment_payment(5).await?.paid_so_far, 100);
    Ok(())
}

#[tokio::test]
async fn test_settle_splits_value() -> Result<()> {
    let h = Harness::new();
    let (client, server) = h.connect(100).await?;
    for _ in 0..5 {
        client.increment_payment(10).await?;
    }

    let settlement = client.settle().await?;
    let mut values: Vec<u64> = settlement.output.iter().map(|out| out.value.to_sat()).collect();
    values.sort_unstable();
    assert_eq!(values, vec![50, 50]);
    assert!(h.broadcaster.contains(&settlement.compute_txid()));

    assert_eq!(server.await??, ServerLifecycle::Closed);
    let server_state = h.server_state(&client)?;
    assert_eq!(server_state.lifecycle, ChannelLifecycle::Closed);
    assert_eq!(server_state.close_reason, Some(CloseReason::ClientRequested));

    let client_state = h.client_state()?;
    assert_eq!(client_state.lifecycle, ChannelLifecycle::Closed);
    assert_eq!(client.state().lifecycle, ClientLifecycle::Closed);

    let err = client.increment_payment(1).await.expect_err("session over");
    assert_eq!(err.kind(), ErrorKind::Closed);
    Ok(())
}

#[tokio::test]
async fn test_resume_after_disconnect() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let h = Harness::with_client_backend(Arc::new(FileBackend::open(dir.path())?));
    let (client, server) = h.connect(100).await?;
    client.increment_payment(30).await?;
    let before = client.state();
    let contract_before = h.client_state()?.contract().clone();

    client.disconnect_without_settlement().await;
    assert_eq!(server.await??, ServerLifecycle::Disconnected);
    assert_eq!(h.client_state()?.lifecycle, ChannelLifecycle::Open);
    assert_eq!(h.server_state(&client)?.lifecycle, ChannelLifecycle::Open);

    let (resumed, _server) = h.connect(100).await?;
    let after = resumed.state();
    assert_eq!(after.lifecycle, ClientLifecycle::Open);
    assert_eq!(after.paid_so_far, 30);
    assert_eq!(after.server_channel_id, before.server_channel_id);
    assert_eq!(after.total_value, before.total_value);
    assert_eq!(after.expiry_time, before.expiry_time);
    assert_eq!(h.client_state()?.contract(), &contract_before);
    // No second contract was funded
    assert_eq!(h.funds.balance(), WALLET - 100);

    assert_eq!(resumed.increment_payment(10).await?.paid_so_far, 40);
    assert_eq!(h.server_state(&resumed)?.paid_so_far(), 40);
    Ok(())
}

#[tokio::test]
async fn test_sweep_refunds_expired_channel_once() -> Result<()> {
    let h = Harness::new();
    let (client, server) = h.connect(100).await?;
    client.increment_payment(30).await?;
    client.disconnect_without_settlement().await;
    server.await??;

    let state = h.client_state()?;
    let refund = state.ledger.refund().clone();
    assert_eq!(refund.value_to(&h.payer_key)?, 70);

    // Still inside the grace period
    h.clock.set(state.expiry_time() + 1);
    let report = h.client_store.sweep_expired(h.clock.now()).await?;
    assert!(report.refunded.is_empty());

    h.clock.set(state.expiry_time() + 300);
    let report = h.client_store.sweep_expired(h.clock.now()).await?;
    assert_eq!(report.refunded, vec![state.channel_id]);
    assert!(h.broadcaster.contains(&refund.txid()));
    let attempts = h.broadcaster.attempts();

    let swept = h.client_state()?;
    assert_eq!(swept.lifecycle, ChannelLifecycle::Closed);
    assert_eq!(swept.close_reason, Some(CloseReason::ChannelExpired));

    let report = h.client_store.sweep_expired(h.clock.now()).await?;
    assert!(report.refunded.is_empty());
    assert_eq!(h.broadcaster.attempts(), attempts);
    Ok(())
}

#[tokio::test]
async fn test_server_sweep_settles_before_expiry() -> Result<()> {
    let h = Harness::new();
    let (client, server) = h.connect(100).await?;
    client.increment_payment(30).await?;
    let server_channel = client.state().server_channel_id.ok_or_else(|| anyhow!("no id"))?;
    client.disconnect_without_settlement().await;
    server.await??;

    let state = h.server_state(&client)?;
    h.clock.set(state.expiry_time() - 3_600);
    let report = h.server_store.sweep_expired(h.clock.now()).await?;
    assert_eq!(report.settled, vec![server_channel]);
    assert!(h.broadcaster.contains(&state.ledger.settlement().txid()));
    assert_eq!(h.server_state(&client)?.lifecycle, ChannelLifecycle::Closed);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_increments() -> Result<()> {
    let h = Harness::new();
    let (client, _server) = h
        .connect_with(h.client_config(), h.server_config(), Arc::new(Slow), 100)
        .await;
    let client = client?;
    let other = client.clone();

    let (first, second) = tokio::join!(client.increment_payment(10), other.increment_payment(10));
    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let err = results.into_iter().find_map(|r| r.err()).ok_or_else(|| anyhow!("no failure"))?;
    assert_eq!(err.kind(), ErrorKind::ConcurrentPaymentInProgress);

    assert_eq!(client.state().paid_so_far, 10);
    assert_eq!(h.server_state(&client)?.paid_so_far(), 10);
    assert_eq!(client.increment_payment(10).await?.paid_so_far, 20);
    Ok(())
}

#[tokio::test]
async fn test_multisig_version() -> Result<()> {
    let h = Harness::new();
    let config = ClientConfig { max_version: 1, ..h.client_config() };
    let (client, server) =
        h.connect_with(config, h.server_config(), Arc::new(AcceptAll), 100).await;
    let client = client?;

    for _ in 0..3 {
        client.increment_payment(10).await?;
    }
    let state = h.client_state()?;
    assert_eq!(state.contract().version, ProtocolVersion::V1);
    // Every increment was countersigned, so the refund is broadcastable
    assert!(state.ledger.refund().is_complete(state.contract()));
    assert_eq!(state.ledger.refund().value_to(&h.payer_key)?, 70);

    let settlement = client.settle().await?;
    assert!(h.broadcaster.contains(&settlement.compute_txid()));
    assert_eq!(server.await??, ServerLifecycle::Closed);
    Ok(())
}

#[tokio::test]
async fn test_initial_minimum_payment() -> Result<()> {
    let h = Harness::new();
    let server = ServerConfig { min_payment: 7, ..h.server_config() };
    let (client, _server) = h.connect_with(h.client_config(), server, Arc::new(AcceptAll), 100).await;
    let client = client?;
    assert_eq!(client.state().paid_so_far, 7);
    assert_eq!(h.server_state(&client)?.paid_so_far(), 7);
    Ok(())
}

#[tokio::test]
async fn test_insufficient_channel_value() -> Result<()> {
    let h = Harness::new();
    let server = ServerConfig { min_channel_value: 1_000, ..h.server_config() };
    let (client, server) =
        h.connect_with(h.client_config(), server, Arc::new(AcceptAll), 100).await;

    let err = client.err().ok_or_else(|| anyhow!("channel opened"))?;
    assert_eq!(err.kind(), ErrorKind::InsufficientChannelValue);
    assert_eq!(h.funds.balance(), WALLET);
    assert!(server.await?.is_err());
    assert!(h.client_store.list()?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_unsupported_version() -> Result<()> {
    let h = Harness::new();
    let config = ClientConfig { max_version: 0, ..h.client_config() };
    let (client, server) =
        h.connect_with(config, h.server_config(), Arc::new(AcceptAll), 100).await;

    let err = client.err().ok_or_else(|| anyhow!("channel opened"))?;
    assert_eq!(err.kind(), ErrorKind::UnsupportedVersion);
    let server_err = server.await?.expect_err("server rejects");
    assert_eq!(server_err.kind(), ErrorKind::UnsupportedVersion);
    Ok(())
}

#[tokio::test]
async fn test_time_window_unacceptable() -> Result<()> {
    let h = Harness::new();
    let config = ClientConfig { time_window_secs: 60, ..h.client_config() };
    let (client, _server) =
        h.connect_with(config, h.server_config(), Arc::new(AcceptAll), 100).await;

    match client.err() {
        Some(Error::Protocol(paychan::errors::ProtocolError::Remote { code, .. })) => {
            assert_eq!(code, ErrorCode::TimeWindowUnacceptable)
        }
        other => panic!("expected time window rejection, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_payment_rejected_by_handler() -> Result<()> {
    let h = Harness::new();
    let (client, _server) =
        h.connect_with(h.client_config(), h.server_config(), Arc::new(Limit(20)), 100).await;
    let client = client?;

    let receipt = client.increment_payment(10).await?;
    assert_eq!(receipt.info, Some(b"total 10".to_vec()));

    let err = client.increment_payment(30).await.expect_err("above limit");
    assert!(matches!(err, Error::Protocol(paychan::errors::ProtocolError::PaymentRejected(_))));
    assert_eq!(client.state().paid_so_far, 10);
    assert_eq!(h.server_state(&client)?.paid_so_far(), 10);

    assert_eq!(client.increment_payment(5).await?.paid_so_far, 15);
    Ok(())
}

#[tokio::test]
async fn test_second_session_for_same_server_is_busy() -> Result<()> {
    let h = Harness::new();
    let (_client, _server) = h.connect(100).await?;
    let (second, _) = h.connect_with(h.client_config(), h.server_config(), Arc::new(AcceptAll), 100).await;
    let err = second.err().ok_or_else(|| anyhow!("second session opened"))?;
    assert_eq!(err.kind(), ErrorKind::ChannelBusy);
    Ok(())
}

#[tokio::test]
async fn test_server_initiated_close() -> Result<()> {
    let h = Harness::new();
    let recorder = Arc::new(Recorder::default());
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let connection = ServerConnection::new(
        server_io,
        h.server(h.server_config(), Arc::clone(&recorder) as Arc<dyn ServerEventHandler>),
    );
    let closer: CloseHandle = connection.close_handle();
    let server = tokio::spawn(connection.run());
    let client = ClientConnection::open(client_io, h.client(h.client_config(), 100)).await?;
    client.increment_payment(25).await?;

    closer.close();
    assert_eq!(server.await??, ServerLifecycle::Closed);
    client.closed().await;
    assert_eq!(client.state().lifecycle, ClientLifecycle::Closed);
    assert_eq!(h.client_state()?.close_reason, Some(CloseReason::ServerRequested));
    assert_eq!(
        *recorder.0.lock().unwrap_or_else(|e| e.into_inner()),
        vec![CloseReason::ServerRequested]
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_inactivity_timeout_settles_unilaterally() -> Result<()> {
    let h = Harness::new();
    let server = ServerConfig {
        inactivity_timeout_secs: 5,
        unilateral_close_on_timeout: true,
        ..h.server_config()
    };
    let (client, server) = h.connect_with(h.client_config(), server, Arc::new(AcceptAll), 100).await;
    let client = client?;
    client.increment_payment(10).await?;

    assert_eq!(server.await??, ServerLifecycle::Closed);
    let state = h.server_state(&client)?;
    assert_eq!(state.close_reason, Some(CloseReason::Timeout));
    assert!(h.broadcaster.contains(&state.ledger.settlement().txid()));

    // The client learns of the settlement and a later session opens a new channel
    client.closed().await;
    assert_eq!(client.state().lifecycle, ClientLifecycle::Closed);
    let client_state = h.client_state()?;
    assert_eq!(client_state.lifecycle, ChannelLifecycle::Closed);
    assert_eq!(client_state.close_reason, Some(CloseReason::Timeout));

    let (next, _server) = h.connect(100).await?;
    assert_eq!(next.state().paid_so_far, 0);
    assert_ne!(next.state().server_channel_id, client.state().server_channel_id);
    assert_eq!(h.funds.balance(), WALLET - 200);
    Ok(())
}

#[tokio::test]
async fn test_increment_refused_inside_settle_margin() -> Result<()> {
    let h = Harness::new();
    let (client, server) = h.connect(100).await?;
    client.increment_payment(30).await?;
    let expiry = client.state().expiry_time.ok_or_else(|| anyhow!("no expiry"))?;

    h.clock.set(expiry - 3_600);
    let err = client.increment_payment(10).await.expect_err("channel expiring");
    assert_eq!(err.kind(), ErrorKind::Closed);
    assert_eq!(server.await??, ServerLifecycle::Closed);

    let state = h.server_state(&client)?;
    assert_eq!(state.lifecycle, ChannelLifecycle::Closed);
    assert_eq!(state.close_reason, Some(CloseReason::ChannelExpired));
    assert_eq!(state.paid_so_far(), 30);
    assert!(h.broadcaster.contains(&state.ledger.settlement().txid()));

    client.closed().await;
    let client_state = h.client_state()?;
    assert_eq!(client_state.lifecycle, ChannelLifecycle::Closed);
    assert_eq!(client_state.close_reason, Some(CloseReason::ChannelExpired));
    assert_eq!(client_state.paid_so_far(), 30);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_idle_session_settles_at_deadline() -> Result<()> {
    let h = Harness::new();
    let server = ServerConfig { inactivity_timeout_secs: 30 * 24 * 3_600, ..h.server_config() };
    let (client, server) = h.connect_with(h.client_config(), server, Arc::new(AcceptAll), 100).await;
    let client = client?;
    client.increment_payment(10).await?;

    // Nothing is sent; paused time runs the session up to expiry minus the margin
    assert_eq!(server.await??, ServerLifecycle::Closed);
    let state = h.server_state(&client)?;
    assert_eq!(state.close_reason, Some(CloseReason::ChannelExpired));
    assert!(h.broadcaster.contains(&state.ledger.settlement().txid()));

    client.closed().await;
    assert_eq!(client.state().lifecycle, ClientLifecycle::Closed);
    assert_eq!(h.client_state()?.close_reason, Some(CloseReason::ChannelExpired));
    Ok(())
}

#[tokio::test]
async fn test_resume_inside_settle_margin_settles() -> Result<()> {
    let h = Harness::new();
    let (client, server) = h.connect(100).await?;
    client.increment_payment(20).await?;
    client.disconnect_without_settlement().await;
    server.await??;

    let state = h.server_state(&client)?;
    h.clock.set(state.expiry_time() - 1_800);
    let (resumed, server) = h
        .connect_with(h.client_config(), h.server_config(), Arc::new(AcceptAll), 100)
        .await;
    let err = resumed.err().ok_or_else(|| anyhow!("expiring channel resumed"))?;
    assert_eq!(err.kind(), ErrorKind::Closed);
    assert_eq!(server.await??, ServerLifecycle::Closed);

    let server_state = h.server_state(&client)?;
    assert_eq!(server_state.close_reason, Some(CloseReason::ChannelExpired));
    assert!(h.broadcaster.contains(&server_state.ledger.settlement().txid()));
    let client_state = h.client_state()?;
    assert_eq!(client_state.lifecycle, ChannelLifecycle::Closed);
    assert_eq!(client_state.paid_so_far(), 20);
    Ok(())
}

#[tokio::test]
async fn test_refused_resume_opens_new_channel() -> Result<()> {
    let h = Harness::new();
    let (client, server) = h.connect(100).await?;
    client.increment_payment(20).await?;
    let old_channel = client.state().server_channel_id.ok_or_else(|| anyhow!("no id"))?;
    client.disconnect_without_settlement().await;
    server.await??;

    // The payee closed the channel while the payer was away
    {
        let guard = h.server_store.lock(&old_channel).await;
        let mut state = h.server_state(&client)?;
        state.mark_closed(CloseReason::ServerRequested, h.clock.now());
        h.server_store.persist(&guard, &state)?;
    }

    let (next, _server) = h.connect(100).await?;
    assert_eq!(next.state().lifecycle, ClientLifecycle::Open);
    assert_eq!(next.state().paid_so_far, 0);
    assert_ne!(next.state().server_channel_id, Some(old_channel));
    assert_eq!(h.funds.balance(), WALLET - 200);
    assert_eq!(h.client_state()?.paid_so_far(), 0);

    let aside = h.client_store.load(&old_channel)?.ok_or_else(|| anyhow!("old channel lost"))?;
    assert!(aside.needs_review);
    assert_eq!(aside.paid_so_far(), 20);
    assert_eq!(aside.lifecycle, ChannelLifecycle::Open);
    Ok(())
}

#[tokio::test]
async fn test_rejected_initial_payment_is_not_resumed() -> Result<()> {
    let h = Harness::new();
    let server = ServerConfig { min_payment: 7, ..h.server_config() };
    let (client, _server) =
        h.connect_with(h.client_config(), server.clone(), Arc::new(Limit(5)), 100).await;
    let err = client.err().ok_or_else(|| anyhow!("channel opened"))?;
    assert!(matches!(err, Error::Protocol(ProtocolError::PaymentRejected(_))));

    let stale = h.client_state()?;
    assert_eq!(stale.lifecycle, ChannelLifecycle::Opening);
    assert!(stale.needs_review);
    let old_channel = stale.remote_channel_id.ok_or_else(|| anyhow!("no server channel"))?;

    let (next, _server) = h.connect_with(h.client_config(), server, Arc::new(AcceptAll), 100).await;
    let next = next?;
    assert_eq!(next.state().paid_so_far, 7);
    assert_ne!(next.state().server_channel_id, Some(old_channel));
    assert_eq!(h.client_state()?.lifecycle, ChannelLifecycle::Open);
    let aside = h.client_store.load(&old_channel)?.ok_or_else(|| anyhow!("old channel lost"))?;
    assert_eq!(aside.lifecycle, ChannelLifecycle::Opening);
    Ok(())
}

#[tokio::test]
async fn test_forged_increment_flags_server_channel() -> Result<()> {
    let h = Harness::new();
    let forger = Arc::new(Forger::new(Arc::clone(&h.signer)));
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let server =
        tokio::spawn(serve_connection(server_io, h.server(h.server_config(), Arc::new(AcceptAll))));
    let machine =
        h.client_with_signer(h.client_config(), 100, Arc::clone(&forger) as Arc<dyn Signer>);
    let client = ClientConnection::open(client_io, machine).await?;
    client.increment_payment(10).await?;

    forger.forging.store(true, Ordering::SeqCst);
    let err = client.increment_payment(10).await.expect_err("bad signature");
    match err {
        Error::Protocol(ProtocolError::Remote { code, .. }) => {
            assert_eq!(code, ErrorCode::BadTransaction)
        }
        other => panic!("expected invalid signature, got {other:?}"),
    }
    assert_eq!(server.await?.expect_err("session aborted").kind(), ErrorKind::InvalidSignature);

    let state = h.server_state(&client)?;
    assert!(state.needs_review);
    assert_eq!(state.paid_so_far(), 10);
    assert_eq!(state.lifecycle, ChannelLifecycle::Open);
    Ok(())
}

#[tokio::test]
async fn test_client_sweep_skips_busy_channel() -> Result<()> {
    let h = Harness::new();
    let (client, server) = h.connect(100).await?;
    client.increment_payment(10).await?;
    let state = h.client_state()?;
    let refund = state.ledger.refund().clone();

    h.clock.set(state.expiry_time() + 300);
    let report = h.client_store.sweep_expired(h.clock.now()).await?;
    assert_eq!(report.busy, vec![state.channel_id]);
    assert!(report.refunded.is_empty());
    assert!(!h.broadcaster.contains(&refund.txid()));

    client.disconnect_without_settlement().await;
    server.await??;
    let report = h.client_store.sweep_expired(h.clock.now()).await?;
    assert_eq!(report.refunded, vec![state.channel_id]);
    assert!(h.broadcaster.contains(&refund.txid()));
    Ok(())
}

#[tokio::test]
async fn test_listener_closes_registered_sessions() -> Result<()> {
    let h = Harness::new();
    let factory: Arc<dyn HandlerFactory> =
        Arc::new(|_peer: &str| -> Arc<dyn ServerEventHandler> { Arc::new(AcceptAll) });
    let listener = ServerListener::bind(
        "127.0.0.1:0",
        h.server_config(),
        h.server_context(),
        h.payee_key,
        factory,
    )
    .await?;
    let addr = listener.local_addr()?;
    let sessions = listener.sessions();
    tokio::spawn(listener.run());

    let client = ClientConnection::connect(addr, h.client(h.client_config(), 100)).await?;
    client.increment_payment(15).await?;
    assert_eq!(sessions.peers().len(), 1);

    assert_eq!(sessions.close_all(), 1);
    client.closed().await;
    assert_eq!(client.state().lifecycle, ClientLifecycle::Closed);
    assert_eq!(h.client_state()?.close_reason, Some(CloseReason::ServerRequested));
    assert_eq!(h.server_state(&client)?.lifecycle, ChannelLifecycle::Closed);

    for _ in 0..100 {
        if sessions.peers().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(sessions.peers().is_empty());
    Ok(())
}
