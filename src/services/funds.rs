//! Funds service
//!
//! Creates the transaction that funds a contract output from the wallet.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use sha2::{Digest, Sha256};

use crate::errors::{Result, ServiceError};
use crate::types::Sats;

/// Domain separation tag for synthetic wallet outpoints
const MEMORY_FUNDS_DOMAIN_TAG: &[u8] = b"PC_MEMORY_FUNDS_v0";

/// Reserves wallet value and builds funding transactions
#[async_trait]
pub trait Funds: Send + Sync {
    /// Builds a signed transaction paying `output`, reserving its inputs
    ///
    /// # Errors
    /// * `ServiceError::InsufficientFunds` - If the wallet cannot cover the value
    async fn fund(&self, output: TxOut) -> Result<Transaction>;

    /// Returns the reservation of a funding transaction that was never broadcast
    async fn release(&self, tx: &Transaction) -> Result<()>;
}

struct Wallet {
    balance: Sats,
    counter: u64,
    reserved: HashSet<Txid>,
}

/// In-memory wallet holding a single balance
pub struct MemoryFunds {
    wallet: Mutex<Wallet>,
}

impl MemoryFunds {
    /// Creates a wallet holding `balance`
    pub fn new(balance: Sats) -> Self {
        Self { wallet: Mutex::new(Wallet { balance, counter: 0, reserved: HashSet::new() }) }
    }

    /// Unreserved balance
    pub fn balance(&self) -> Sats {
        self.wallet.lock().unwrap_or_else(PoisonError::into_inner).balance
    }
}

fn synthetic_outpoint(counter: u64) -> OutPoint {
    let mut hasher = Sha256::new();
    hasher.update(MEMORY_FUNDS_DOMAIN_TAG);
    hasher.update(counter.to_be_bytes());
    OutPoint { txid: Txid::from_byte_array(hasher.finalize().into()), vout: 0 }
}

#[async_trait]
impl Funds for MemoryFunds {
    async fn fund(&self, output: TxOut) -> Result<Transaction> {
        let mut wallet = self.wallet.lock().unwrap_or_else(PoisonError::into_inner);
        let requested = output.value.to_sat();
        if requested > wallet.balance {
            return Err(ServiceError::InsufficientFunds { requested, available: wallet.balance }
                .into());
        }
        wallet.balance -= requested;
        wallet.counter += 1;

        let input = TxIn {
            previous_output: synthetic_outpoint(wallet.counter),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        };
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![input],
            output: vec![output],
        };
        wallet.reserved.insert(tx.compute_txid());
        Ok(tx)
    }

    async fn release(&self, tx: &Transaction) -> Result<()> {
        let mut wallet = self.wallet.lock().unwrap_or_else(PoisonError::into_inner);
        if wallet.reserved.remove(&tx.compute_txid()) {
            let value: Sats = tx.output.iter().map(|out| out.value.to_sat()).sum();
            wallet.balance += value;
        }
        Ok(())
    }
}
