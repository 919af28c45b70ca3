//! Refund and settlement instruments
//!
//! Both instruments spend the contract output and pay the same split: the
//! payer's residual first, then the payee's `paid_so_far`. They differ only
//! in timing. A refund carries the contract expiry as its lock time, a
//! settlement is valid immediately.

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{ecdsa::Signature, Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{Amount, PublicKey, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use serde::{Deserialize, Serialize};

use crate::channel::contract::ChannelContract;
use crate::errors::{ChannelError, Result};
use crate::protocol::version::ContractKind;
use crate::types::{Role, Sats};

/// Which instrument a transaction is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstrumentKind {
    /// Time-locked return of the payer's residual
    Refund,
    /// Immediate split closing the channel
    Settlement,
}

/// Calculate instrument outputs with the funder-pays fee policy
///
/// The payer (funder) pays the fee from its residual. Whatever the residual
/// cannot cover is taken from the payee's share.
///
/// # Arguments
/// * `total_value` - Value locked in the contract
/// * `paid_so_far` - Amount owed to the payee
/// * `fee` - Fee carried by the instrument
///
/// # Returns
/// * `Ok((payer_output, payee_output))` - Output values after fee deduction
/// * `Err(ChannelError::ValueOutOfRange)` - If `paid_so_far` exceeds the channel value
/// * `Err(ChannelError::FeeExceedsValue)` - If the fee consumes the whole channel
pub fn calculate_instrument_outputs(
    total_value: Sats,
    paid_so_far: Sats,
    fee: Sats,
) -> Result<(Sats, Sats)> {
    let payer_balance = total_value.checked_sub(paid_so_far).ok_or(
        ChannelError::ValueOutOfRange { paid: paid_so_far, amount: 0, total: total_value },
    )?;
    if fee >= total_value {
        return Err(ChannelError::FeeExceedsValue { fee, total: total_value }.into());
    }
    if payer_balance >= fee {
        Ok((payer_balance - fee, paid_so_far))
    } else {
        Ok((0, paid_so_far - (fee - payer_balance)))
    }
}

/// Parses a DER encoded ECDSA signature received from a peer
pub fn parse_signature(bytes: &[u8], what: &str) -> Result<Signature> {
    Signature::from_der(bytes).map_err(|_| ChannelError::InvalidSignature(what.to_string()).into())
}

fn p2wpkh(key: &PublicKey) -> Result<ScriptBuf> {
    let hash = key.wpubkey_hash().map_err(|e| ChannelError::InvalidContract(e.to_string()))?;
    Ok(ScriptBuf::new_p2wpkh(&hash))
}

fn sighash_type_suffixed(signature: &Signature) -> Vec<u8> {
    bitcoin::ecdsa::Signature { signature: *signature, sighash_type: EcdsaSighashType::All }
        .to_vec()
}

/// A refund or settlement with whatever signatures have been collected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    /// Refund or settlement
    pub kind: InstrumentKind,
    /// Amount paid to the payee by this instrument, before fees
    pub paid_so_far: Sats,
    /// Unsigned transaction
    #[serde(with = "crate::utils::consensus_tx")]
    pub tx: Transaction,
    /// Payer's signature, once known
    pub payer_signature: Option<Signature>,
    /// Payee's signature, once known
    pub payee_signature: Option<Signature>,
}

impl Instrument {
    /// Builds an unsigned instrument spending `contract`
    ///
    /// # Errors
    /// * `ChannelError::NotFunded` - If the contract outpoint is unknown
    /// * `ChannelError::ValueOutOfRange` / `FeeExceedsValue` - From output calculation
    pub fn build(
        contract: &ChannelContract,
        kind: InstrumentKind,
        paid_so_far: Sats,
        fee: Sats,
    ) -> Result<Self> {
        let (payer_value, payee_value) =
            calculate_instrument_outputs(contract.total_value, paid_so_far, fee)?;

        let (lock_time, sequence) = match kind {
            InstrumentKind::Refund => (contract.lock_time(), Sequence::ENABLE_LOCKTIME_NO_RBF),
            InstrumentKind::Settlement => (LockTime::ZERO, Sequence::MAX),
        };

        let input = TxIn {
            previous_output: contract.funding_outpoint()?,
            script_sig: ScriptBuf::new(), // Empty for SegWit
            sequence,
            witness: Witness::new(), // Populated by `finalize`
        };

        let mut output = Vec::with_capacity(2);
        if payer_value > 0 {
            output.push(TxOut {
                value: Amount::from_sat(payer_value),
                script_pubkey: p2wpkh(&contract.payer_key)?,
            });
        }
        if payee_value > 0 {
            output.push(TxOut {
                value: Amount::from_sat(payee_value),
                script_pubkey: p2wpkh(&contract.payee_key)?,
            });
        }

        let tx = Transaction { version: Version::TWO, lock_time, input: vec![input], output };
        Ok(Self { kind, paid_so_far, tx, payer_signature: None, payee_signature: None })
    }

    /// Transaction id of the unsigned transaction (witness data does not change it)
    pub fn txid(&self) -> Txid { self.tx.compute_txid() }

    /// BIP143 digest both parties sign
    pub fn sighash(&self, contract: &ChannelContract) -> Result<[u8; 32]> {
        let script = contract.witness_script();
        let mut cache = SighashCache::new(&self.tx);
        let sighash = cache
            .p2wsh_signature_hash(
                0,
                &script,
                Amount::from_sat(contract.total_value),
                EcdsaSighashType::All,
            )
            .map_err(|e| ChannelError::Sighash(e.to_string()))?;
        Ok(sighash.to_byte_array())
    }

    /// Verifies `signature` as `party`'s signature over this instrument
    ///
    /// # Errors
    /// * `ChannelError::InvalidSignature` - If the signature does not verify
    pub fn verify(
        &self,
        contract: &ChannelContract,
        party: Role,
        signature: &Signature,
    ) -> Result<()> {
        let key = match party {
            Role::Client => &contract.payer_key,
            Role::Server => &contract.payee_key,
        };
        let message = Message::from_digest(self.sighash(contract)?);
        let secp = Secp256k1::verification_only();
        secp.verify_ecdsa(&message, signature, &key.inner).map_err(|_| {
            ChannelError::InvalidSignature(format!("{:?} {:?} signature", self.kind, party))
        })?;
        Ok(())
    }

    /// Verifies and records `party`'s signature
    pub fn attach(
        &mut self,
        contract: &ChannelContract,
        party: Role,
        signature: Signature,
    ) -> Result<()> {
        self.verify(contract, party, &signature)?;
        match party {
            Role::Client => self.payer_signature = Some(signature),
            Role::Server => self.payee_signature = Some(signature),
        }
        Ok(())
    }

    /// Total value this instrument pays to `key`
    pub fn value_to(&self, key: &PublicKey) -> Result<Sats> {
        let script = p2wpkh(key)?;
        Ok(self
            .tx
            .output
            .iter()
            .filter(|out| out.script_pubkey == script)
            .map(|out| out.value.to_sat())
            .sum())
    }

    /// Whether the instrument carries every signature its spend path needs
    pub fn is_complete(&self, contract: &ChannelContract) -> bool {
        let needs_payee = !(contract.version.contract_kind() == ContractKind::TimeLocked
            && self.kind == InstrumentKind::Refund);
        self.payer_signature.is_some() && (!needs_payee || self.payee_signature.is_some())
    }

    /// Returns the transaction with its witness filled in
    ///
    /// # Errors
    /// * `ChannelError::MissingSignature` - If a required signature is absent
    pub fn finalize(&self, contract: &ChannelContract) -> Result<Transaction> {
        let missing = |who: &str| {
            ChannelError::MissingSignature(format!("{who} signature on {:?}", self.kind))
        };
        let payer = self.payer_signature.as_ref().ok_or_else(|| missing("payer"))?;
        let script = contract.witness_script();

        let witness = match (contract.version.contract_kind(), self.kind) {
            (ContractKind::TimeLocked, InstrumentKind::Refund) => {
                Witness::from_slice(&[sighash_type_suffixed(payer), Vec::new(), script.to_bytes()])
            }
            (ContractKind::TimeLocked, InstrumentKind::Settlement) => {
                let payee = self.payee_signature.as_ref().ok_or_else(|| missing("payee"))?;
                Witness::from_slice(&[
                    sighash_type_suffixed(payer),
                    sighash_type_suffixed(payee),
                    vec![1u8],
                    script.to_bytes(),
                ])
            }
            (ContractKind::Multisig, _) => {
                let payee = self.payee_signature.as_ref().ok_or_else(|| missing("payee"))?;
                // CHECKMULTISIG pops one extra element
                Witness::from_slice(&[
                    Vec::new(),
                    sighash_type_suffixed(payer),
                    sighash_type_suffixed(payee),
                    script.to_bytes(),
                ])
            }
        };

        let mut tx = self.tx.clone();
        tx.input[0].witness = witness;
        Ok(tx)
    }
}
