//! Channel store
//!
//! Durable registry of channel states keyed by [`ChannelId`], with a
//! per-channel exclusive lock and the expiry sweep.
//!
//! # Locking
//!
//! Every negotiation on a channel holds its [`ChannelGuard`] for as long as
//! it runs. Writes require the guard. The sweep only ever `try_lock`s, so a
//! busy channel is skipped rather than waited on and unrelated channels are
//! never blocked. A slot is dropped from the registry when its last guard
//! is released and nobody is waiting on it.

pub mod backend;
pub mod record;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

pub use backend::{FileBackend, MemoryBackend, StoreBackend};
pub use record::{decode_record, encode_record, ChannelStoreRecord, RECORD_FORMAT_VERSION};

use crate::channel::state::{ChannelLifecycle, ChannelState};
use crate::config::StoreConfig;
use crate::errors::{Result, StoreError};
use crate::protocol::messages::CloseReason;
use crate::services::{Broadcaster, Clock};
use crate::types::{ChannelId, Role, Timestamp};

type Slots = Arc<Mutex<HashMap<ChannelId, Arc<AsyncMutex<()>>>>>;

fn release_slot(slots: &Slots, channel_id: &ChannelId) {
    let mut slots = slots.lock().unwrap_or_else(PoisonError::into_inner);
    // The map holds the only reference once nobody locks or waits
    if slots.get(channel_id).is_some_and(|slot| Arc::strong_count(slot) == 1) {
        slots.remove(channel_id);
    }
}

/// Exclusive right to negotiate on one channel
pub struct ChannelGuard {
    channel_id: ChannelId,
    guard: Option<OwnedMutexGuard<()>>,
    slots: Slots,
}

impl ChannelGuard {
    /// Channel this guard locks
    pub fn channel_id(&self) -> ChannelId { self.channel_id }
}

impl fmt::Debug for ChannelGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelGuard").field("channel_id", &self.channel_id).finish_non_exhaustive()
    }
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        release_slot(&self.slots, &self.channel_id);
    }
}

/// Outcome of one sweep pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Client channels whose refund was broadcast
    pub refunded: Vec<ChannelId>,
    /// Server channels whose settlement was broadcast
    pub settled: Vec<ChannelId>,
    /// Server channels closed with nothing to claim
    pub expired: Vec<ChannelId>,
    /// Channels skipped because a session holds them
    pub busy: Vec<ChannelId>,
    /// Channels that could not be swept, with the reason
    pub failed: Vec<(ChannelId, String)>,
}

enum SweepAction {
    Refund,
    Settle,
    Expire,
}

/// Durable, per-channel-locked registry of channel states
pub struct ChannelStore {
    backend: Arc<dyn StoreBackend>,
    broadcaster: Arc<dyn Broadcaster>,
    clock: Arc<dyn Clock>,
    config: StoreConfig,
    slots: Slots,
}

impl ChannelStore {
    /// Creates a store over `backend`
    pub fn new(
        backend: Arc<dyn StoreBackend>,
        broadcaster: Arc<dyn Broadcaster>,
        clock: Arc<dyn Clock>,
        config: StoreConfig,
    ) -> Self {
        Self { backend, broadcaster, clock, config, slots: Slots::default() }
    }

    /// Store configuration
    pub fn config(&self) -> &StoreConfig { &self.config }

    /// Current time according to the store's clock
    pub fn now(&self) -> Timestamp { self.clock.now() }

    fn slot(&self, channel_id: &ChannelId) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(*channel_id).or_default())
    }

    fn guard(&self, channel_id: &ChannelId, guard: OwnedMutexGuard<()>) -> ChannelGuard {
        ChannelGuard { channel_id: *channel_id, guard: Some(guard), slots: Arc::clone(&self.slots) }
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize { self.slots.lock().unwrap_or_else(PoisonError::into_inner).len() }

    /// Waits for exclusive access to `channel_id`
    pub async fn lock(&self, channel_id: &ChannelId) -> ChannelGuard {
        let guard = self.slot(channel_id).lock_owned().await;
        self.guard(channel_id, guard)
    }

    /// Takes exclusive access to `channel_id` without waiting
    ///
    /// # Errors
    /// * `StoreError::ChannelBusy` - If another negotiation holds the channel
    pub fn try_lock(&self, channel_id: &ChannelId) -> Result<ChannelGuard> {
        match self.slot(channel_id).try_lock_owned() {
            Ok(guard) => Ok(self.guard(channel_id, guard)),
            Err(_) => {
                // The holder may have released while we looked
                release_slot(&self.slots, channel_id);
                Err(StoreError::ChannelBusy(*channel_id).into())
            }
        }
    }

    /// Locks `channel_id` and returns its stored state, if any
    ///
    /// The returned guard reserves the slot whether or not a state exists.
    pub async fn get_or_create(
        &self,
        channel_id: &ChannelId,
    ) -> Result<(ChannelGuard, Option<ChannelState>)> {
        let guard = self.lock(channel_id).await;
        let state = self.load(channel_id)?;
        Ok((guard, state))
    }

    /// Loads the stored state of `channel_id`
    pub fn load(&self, channel_id: &ChannelId) -> Result<Option<ChannelState>> {
        self.backend.get(channel_id)?.map(|bytes| decode_record(&bytes)).transpose()
    }

    /// Atomically upserts `state`
    ///
    /// # Errors
    /// * `StoreError::LockNotHeld` - If `guard` locks a different channel
    pub fn persist(&self, guard: &ChannelGuard, state: &ChannelState) -> Result<()> {
        if guard.channel_id != state.channel_id {
            return Err(StoreError::LockNotHeld(state.channel_id).into());
        }
        self.backend.put(&state.channel_id, &encode_record(state)?)?;
        debug!(
            channel = %state.channel_id,
            lifecycle = ?state.lifecycle,
            paid = state.paid_so_far(),
            "persisted channel"
        );
        Ok(())
    }

    /// Deletes the record of the channel `guard` locks
    pub fn remove(&self, guard: &ChannelGuard) -> Result<()> {
        self.backend.delete(&guard.channel_id)?;
        debug!(channel = %guard.channel_id, "removed channel record");
        Ok(())
    }

    /// All stored states
    pub fn list(&self) -> Result<Vec<ChannelState>> {
        let mut states = Vec::new();
        for channel_id in self.backend.list()? {
            if let Some(state) = self.load(&channel_id)? {
                states.push(state);
            }
        }
        Ok(states)
    }

    /// The payer's channel with `server_id`, if it can still be resumed at `now`
    pub fn find_resumable(&self, server_id: &str, now: Timestamp) -> Result<Option<ChannelState>> {
        let channel_id = ChannelId::for_server(server_id);
        Ok(self
            .load(&channel_id)?
            .filter(|state| state.role == Role::Client && state.is_resumable(now)))
    }

    /// Deletes closed records, skipping channels that are locked
    pub fn prune_closed(&self) -> Result<usize> {
        let mut pruned = 0;
        for state in self.list()? {
            if !state.is_closed() {
                continue;
            }
            let Ok(_guard) = self.try_lock(&state.channel_id) else {
                continue;
            };
            self.backend.delete(&state.channel_id)?;
            pruned += 1;
        }
        Ok(pruned)
    }

    /// Serializes every stored state into one blob
    pub fn export(&self) -> Result<Vec<u8>> { record::encode_snapshot(self.list()?) }

    /// Upserts every state from a blob produced by [`ChannelStore::export`]
    ///
    /// # Errors
    /// * `StoreError::ChannelBusy` - If a channel in the blob is locked
    pub fn import(&self, bytes: &[u8]) -> Result<usize> {
        let states = record::decode_snapshot(bytes)?;
        for state in &states {
            let guard = self.try_lock(&state.channel_id)?;
            self.persist(&guard, state)?;
        }
        Ok(states.len())
    }

    fn sweep_action(&self, state: &ChannelState, now: Timestamp) -> Option<SweepAction> {
        let expiry = state.expiry_time();
        match state.role {
            Role::Client => {
                (now >= expiry.saturating_add(self.config.refund_grace_secs))
                    .then_some(SweepAction::Refund)
            }
            Role::Server if state.paid_so_far() > 0 => {
                (now >= expiry.saturating_sub(self.config.settle_margin_secs))
                    .then_some(SweepAction::Settle)
            }
            Role::Server => (now >= expiry).then_some(SweepAction::Expire),
        }
    }

    async fn sweep_one(
        &self,
        guard: &ChannelGuard,
        mut state: ChannelState,
        action: SweepAction,
        now: Timestamp,
        report: &mut SweepReport,
    ) -> Result<()> {
        let channel_id = state.channel_id;
        let instrument = match action {
            SweepAction::Expire => None,
            SweepAction::Refund => Some(state.ledger.refund().clone()),
            SweepAction::Settle => Some(state.ledger.settlement().clone()),
        };

        if let Some(instrument) = instrument {
            let tx = instrument.finalize(state.contract())?;
            let txid = instrument.txid();
            if state.broadcast_txids.contains(&txid) {
                debug!(channel = %channel_id, %txid, "instrument already broadcast");
            } else {
                self.broadcaster.broadcast(&tx).await?;
                state.record_broadcast(txid);
                info!(
                    channel = %channel_id,
                    %txid,
                    kind = ?instrument.kind,
                    paid = state.paid_so_far(),
                    "broadcast expiring channel instrument"
                );
            }
        }

        state.mark_closed(CloseReason::ChannelExpired, now);
        self.persist(guard, &state)?;

        match action {
            SweepAction::Refund => report.refunded.push(channel_id),
            SweepAction::Settle => report.settled.push(channel_id),
            SweepAction::Expire => report.expired.push(channel_id),
        }
        Ok(())
    }

    /// Closes every channel whose deadline has passed at `now`
    ///
    /// - client channels past `expiry + refund_grace` broadcast their refund
    /// - server channels owed money settle `settle_margin` before expiry
    /// - server channels with nothing paid are closed once expired
    ///
    /// Each instrument is broadcast at most once. Busy channels are skipped
    /// and reported; a failure on one channel does not stop the pass.
    #[instrument(skip(self))]
    pub async fn sweep_expired(&self, now: Timestamp) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        for channel_id in self.backend.list()? {
            let guard = match self.try_lock(&channel_id) {
                Ok(guard) => guard,
                Err(_) => {
                    debug!(channel = %channel_id, "skipping busy channel");
                    report.busy.push(channel_id);
                    continue;
                }
            };
            let state = match self.load(&channel_id) {
                Ok(Some(state)) if state.lifecycle != ChannelLifecycle::Closed => state,
                Ok(_) => continue,
                Err(e) => {
                    warn!(channel = %channel_id, error = %e, "unreadable channel record");
                    report.failed.push((channel_id, e.to_string()));
                    continue;
                }
            };
            let Some(action) = self.sweep_action(&state, now) else {
                continue;
            };
            if let Err(e) = self.sweep_one(&guard, state, action, now, &mut report).await {
                warn!(channel = %channel_id, error = %e, "failed to sweep channel");
                report.failed.push((channel_id, e.to_string()));
            }
        }
        if report != SweepReport::default() {
            info!(
                refunded = report.refunded.len(),
                settled = report.settled.len(),
                expired = report.expired.len(),
                busy = report.busy.len(),
                failed = report.failed.len(),
                "sweep finished"
            );
        }
        Ok(report)
    }

    /// Runs [`ChannelStore::sweep_expired`] every `sweep_interval`
    ///
    /// Abort the returned handle to stop sweeping.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(store.config.sweep_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = store.sweep_expired(store.clock.now()).await {
                    warn!(error = %e, "sweep failed");
                }
            }
        })
    }
}
