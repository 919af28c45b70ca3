//! Broadcast service
//!
//! Hands transactions to the network and reports how deep they are buried.
//! Broadcasting the same transaction twice must be a no-op.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use bitcoin::{Transaction, Txid};
use tokio::sync::Notify;
use tracing::debug;

use crate::errors::{Result, ServiceError};

/// Handle to a broadcast transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BroadcastHandle {
    /// Transaction id
    pub txid: Txid,
}

/// Reported once a transaction reaches the requested depth
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthNotification {
    /// Transaction id
    pub txid: Txid,
    /// Depth at the time of the notification
    pub depth: u32,
}

/// Publishes transactions and tracks their inclusion depth
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Broadcasts `tx`; repeating a broadcast returns the same handle
    ///
    /// # Errors
    /// * `ServiceError::Broadcast` - If the transaction is rejected
    async fn broadcast(&self, tx: &Transaction) -> Result<BroadcastHandle>;

    /// Resolves once the transaction is buried `depth` blocks deep
    ///
    /// A depth of zero resolves as soon as the transaction is known.
    async fn await_depth(&self, handle: &BroadcastHandle, depth: u32)
        -> Result<DepthNotification>;
}

#[derive(Default)]
struct MemoryPool {
    // Unique transactions in broadcast order
    transactions: Vec<Transaction>,
    depths: HashMap<Txid, u32>,
    attempts: usize,
    reject: bool,
}

/// In-memory broadcaster that remembers every transaction it sees
#[derive(Default)]
pub struct MemoryBroadcaster {
    pool: Mutex<MemoryPool>,
    mined: Notify,
}

impl MemoryBroadcaster {
    /// Creates an empty broadcaster
    pub fn new() -> Self { Self::default() }

    /// Unique transactions broadcast so far, oldest first
    pub fn transactions(&self) -> Vec<Transaction> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner).transactions.clone()
    }

    /// Number of `broadcast` calls, duplicates included
    pub fn attempts(&self) -> usize {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner).attempts
    }

    /// Whether `txid` has been broadcast
    pub fn contains(&self, txid: &Txid) -> bool {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner).depths.contains_key(txid)
    }

    /// Makes later broadcasts fail
    pub fn set_reject(&self, reject: bool) {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner).reject = reject;
    }

    /// Buries every known transaction `blocks` deeper
    pub fn mine(&self, blocks: u32) {
        {
            let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
            for depth in pool.depths.values_mut() {
                *depth = depth.saturating_add(blocks);
            }
        }
        self.mined.notify_waiters();
    }

    fn depth_of(&self, txid: &Txid) -> Option<u32> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner).depths.get(txid).copied()
    }
}

#[async_trait]
impl Broadcaster for MemoryBroadcaster {
    async fn broadcast(&self, tx: &Transaction) -> Result<BroadcastHandle> {
        let txid = tx.compute_txid();
        let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        pool.attempts += 1;
        if pool.reject {
            return Err(ServiceError::Broadcast(format!("transaction {txid} rejected")).into());
        }
        if pool.depths.contains_key(&txid) {
            debug!(%txid, "duplicate broadcast ignored");
        } else {
            pool.depths.insert(txid, 0);
            pool.transactions.push(tx.clone());
            debug!(%txid, "broadcast");
        }
        Ok(BroadcastHandle { txid })
    }

    async fn await_depth(
        &self,
        handle: &BroadcastHandle,
        depth: u32,
    ) -> Result<DepthNotification> {
        loop {
            let mined = self.mined.notified();
            tokio::pin!(mined);
            mined.as_mut().enable();

            match self.depth_of(&handle.txid) {
                None => {
                    return Err(ServiceError::Broadcast(format!(
                        "transaction {} was never broadcast",
                        handle.txid
                    ))
                    .into())
                }
                Some(current) if current >= depth => {
                    return Ok(DepthNotification { txid: handle.txid, depth: current })
                }
                Some(_) => mined.await,
            }
        }
    }
}
