//! Channel contract model
//!
//! The contract is the funding output locking `total_value` between payer
//! and payee until `expiry_time`. Its script depends on the negotiated
//! protocol version:
//! - Multisig: `2 <payer> <payee> 2 OP_CHECKMULTISIG`
//! - TimeLocked: `OP_IF <payee> OP_CHECKSIGVERIFY OP_ELSE <expiry> OP_CLTV
//!   OP_DROP OP_ENDIF <payer> OP_CHECKSIG`
//!
//! Both are wrapped in P2WSH.

use bitcoin::absolute::LockTime;
use bitcoin::opcodes::all::{
    OP_CHECKMULTISIG, OP_CHECKSIG, OP_CHECKSIGVERIFY, OP_CLTV, OP_DROP, OP_ELSE, OP_ENDIF, OP_IF,
};
use bitcoin::script::Builder;
use bitcoin::{Amount, OutPoint, PublicKey, ScriptBuf, Transaction, TxOut};
use serde::{Deserialize, Serialize};

use crate::errors::{ChannelError, Result};
use crate::protocol::version::{ContractKind, ProtocolVersion};
use crate::types::{Sats, Timestamp, LOCKTIME_THRESHOLD};

/// Immutable terms of a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelContract {
    /// Value locked in the contract output
    pub total_value: Sats,
    /// Absolute UNIX time after which the refund is valid
    pub expiry_time: Timestamp,
    /// Key of the party funding the channel
    pub payer_key: PublicKey,
    /// Key of the party receiving increments
    pub payee_key: PublicKey,
    /// Protocol version the contract was negotiated under
    pub version: ProtocolVersion,
    /// Location of the contract output once funded
    pub funding: Option<OutPoint>,
}

/// Builds the 2-of-2 multisig witness script
pub fn build_multisig_script(payer_key: &PublicKey, payee_key: &PublicKey) -> ScriptBuf {
    Builder::new()
        .push_int(2)
        .push_key(payer_key)
        .push_key(payee_key)
        .push_int(2)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script()
}

/// Builds the witness script whose else-branch lets the payer spend alone after `lock_time`
pub fn build_timelocked_script(
    payer_key: &PublicKey,
    payee_key: &PublicKey,
    lock_time: LockTime,
) -> ScriptBuf {
    Builder::new()
        .push_opcode(OP_IF)
        .push_key(payee_key)
        .push_opcode(OP_CHECKSIGVERIFY)
        .push_opcode(OP_ELSE)
        .push_int(i64::from(lock_time.to_consensus_u32()))
        .push_opcode(OP_CLTV)
        .push_opcode(OP_DROP)
        .push_opcode(OP_ENDIF)
        .push_key(payer_key)
        .push_opcode(OP_CHECKSIG)
        .into_script()
}

impl ChannelContract {
    /// Creates unfunded contract terms
    ///
    /// # Errors
    /// * `ChannelError::InvalidExpiry` - If `expiry_time` is not a time-based lock time
    /// * `ChannelError::InvalidContract` - If the value is zero or both keys are equal
    pub fn new(
        total_value: Sats,
        expiry_time: Timestamp,
        payer_key: PublicKey,
        payee_key: PublicKey,
        version: ProtocolVersion,
    ) -> Result<Self> {
        if expiry_time < LOCKTIME_THRESHOLD || expiry_time > u64::from(u32::MAX) {
            return Err(ChannelError::InvalidExpiry(expiry_time).into());
        }
        if total_value == 0 {
            return Err(ChannelError::InvalidContract("zero channel value".to_string()).into());
        }
        if payer_key == payee_key {
            return Err(ChannelError::InvalidContract("payer and payee keys are equal".to_string())
                .into());
        }
        Ok(Self { total_value, expiry_time, payer_key, payee_key, version, funding: None })
    }

    /// Returns the same terms located at `outpoint`
    pub fn with_funding(mut self, outpoint: OutPoint) -> Self {
        self.funding = Some(outpoint);
        self
    }

    /// Funding outpoint, or `NotFunded`
    pub fn funding_outpoint(&self) -> Result<OutPoint> {
        self.funding.ok_or_else(|| ChannelError::NotFunded.into())
    }

    /// Absolute lock time carried by refunds
    pub fn lock_time(&self) -> LockTime {
        // Range checked in `new`
        LockTime::from_consensus(self.expiry_time as u32)
    }

    /// Witness script of the contract output
    pub fn witness_script(&self) -> ScriptBuf {
        match self.version.contract_kind() {
            ContractKind::Multisig => build_multisig_script(&self.payer_key, &self.payee_key),
            ContractKind::TimeLocked => {
                build_timelocked_script(&self.payer_key, &self.payee_key, self.lock_time())
            }
        }
    }

    /// P2WSH script pubkey of the contract output
    pub fn script_pubkey(&self) -> ScriptBuf { ScriptBuf::new_p2wsh(&self.witness_script().wscript_hash()) }

    /// The contract output itself
    pub fn txout(&self) -> TxOut {
        TxOut { value: Amount::from_sat(self.total_value), script_pubkey: self.script_pubkey() }
    }

    /// Whether the refund has become valid at `now`
    pub fn is_expired(&self, now: Timestamp) -> bool { now >= self.expiry_time }

    /// Finds the contract output in `tx`
    ///
    /// # Errors
    /// * `ChannelError::ContractMismatch` - If no output pays the contract script and value
    pub fn locate_output(&self, tx: &Transaction) -> Result<OutPoint> {
        let expected = self.txout();
        tx.output
            .iter()
            .position(|out| *out == expected)
            .map(|vout| OutPoint { txid: tx.compute_txid(), vout: vout as u32 })
            .ok_or_else(|| {
                ChannelError::ContractMismatch("no output pays the contract".to_string()).into()
            })
    }

    /// Checks that `tx` creates this contract's output at the agreed outpoint
    ///
    /// # Errors
    /// * `ChannelError::NotFunded` - If no outpoint was agreed
    /// * `ChannelError::ContractMismatch` - If `tx` does not create the output
    pub fn validate_funding(&self, tx: &Transaction) -> Result<()> {
        let outpoint = self.funding_outpoint()?;
        if tx.compute_txid() != outpoint.txid {
            return Err(ChannelError::ContractMismatch(format!(
                "funding txid {} does not match agreed {}",
                tx.compute_txid(),
                outpoint.txid
            ))
            .into());
        }
        match tx.output.get(outpoint.vout as usize) {
            Some(out) if *out == self.txout() => Ok(()),
            _ => Err(ChannelError::ContractMismatch(format!(
                "output {} does not pay the contract",
                outpoint.vout
            ))
            .into()),
        }
    }
}
