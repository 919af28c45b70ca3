//! Refund/payment ledger
//!
//! Tracks `paid_so_far` for one channel together with the current refund and
//! settlement. An increment is a two-step affair: [`Ledger::propose_increment`]
//! builds the next pair of instruments without touching the ledger, and
//! [`Ledger::accept_increment`] verifies the collected signatures and
//! replaces the current pair.

use bitcoin::secp256k1::ecdsa::Signature;
use serde::{Deserialize, Serialize};

use crate::channel::contract::ChannelContract;
use crate::channel::instrument::{Instrument, InstrumentKind};
use crate::errors::{ChannelError, Result};
use crate::types::{Role, Sats};

/// The next refund and settlement for a proposed increment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementProposal {
    /// Value added by the increment
    pub amount: Sats,
    /// Cumulative amount after the increment
    pub paid_so_far: Sats,
    /// Unsigned replacement refund
    pub refund: Instrument,
    /// Unsigned replacement settlement
    pub settlement: Instrument,
}

/// Signatures collected for an [`IncrementProposal`]
///
/// The payer's settlement signature is always required. The payee's refund
/// signature is required when the protocol version countersigns increments.
/// The remaining two are kept when a side has them so the stored
/// instruments can be broadcast without a signer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncrementSignatures {
    /// Payer over the new settlement
    pub settlement_payer: Option<Signature>,
    /// Payee over the new settlement
    pub settlement_payee: Option<Signature>,
    /// Payer over the new refund
    pub refund_payer: Option<Signature>,
    /// Payee over the new refund
    pub refund_payee: Option<Signature>,
}

/// Payment state of a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    contract: ChannelContract,
    instrument_fee: Sats,
    paid_so_far: Sats,
    refund: Instrument,
    settlement: Instrument,
}

impl Ledger {
    /// Creates a ledger with nothing paid
    ///
    /// # Errors
    /// * `ChannelError::NotFunded` - If the contract has no outpoint
    /// * `ChannelError::FeeExceedsValue` - If the fee consumes the channel
    pub fn new(contract: ChannelContract, instrument_fee: Sats) -> Result<Self> {
        let refund = Instrument::build(&contract, InstrumentKind::Refund, 0, instrument_fee)?;
        let settlement =
            Instrument::build(&contract, InstrumentKind::Settlement, 0, instrument_fee)?;
        Ok(Self { contract, instrument_fee, paid_so_far: 0, refund, settlement })
    }

    /// The contract this ledger spends
    pub fn contract(&self) -> &ChannelContract { &self.contract }

    /// Fee carried by each instrument
    pub fn instrument_fee(&self) -> Sats { self.instrument_fee }

    /// Amount owed to the payee
    pub fn paid_so_far(&self) -> Sats { self.paid_so_far }

    /// Value the payer can still send
    pub fn remaining(&self) -> Sats { self.contract.total_value - self.paid_so_far }

    /// Current refund
    pub fn refund(&self) -> &Instrument { &self.refund }

    /// Current settlement
    pub fn settlement(&self) -> &Instrument { &self.settlement }

    /// Builds the instruments for paying `amount` more
    ///
    /// # Errors
    /// * `ChannelError::ZeroIncrement` - If `amount` is zero
    /// * `ChannelError::ValueOutOfRange` - If the sum overflows or exceeds the channel value
    pub fn propose_increment(&self, amount: Sats) -> Result<IncrementProposal> {
        if amount == 0 {
            return Err(ChannelError::ZeroIncrement.into());
        }
        let out_of_range = || ChannelError::ValueOutOfRange {
            paid: self.paid_so_far,
            amount,
            total: self.contract.total_value,
        };
        let paid_so_far = self.paid_so_far.checked_add(amount).ok_or_else(out_of_range)?;
        if paid_so_far > self.contract.total_value {
            return Err(out_of_range().into());
        }

        let refund = Instrument::build(
            &self.contract,
            InstrumentKind::Refund,
            paid_so_far,
            self.instrument_fee,
        )?;
        let settlement = Instrument::build(
            &self.contract,
            InstrumentKind::Settlement,
            paid_so_far,
            self.instrument_fee,
        )?;
        Ok(IncrementProposal { amount, paid_so_far, refund, settlement })
    }

    /// Builds the instruments for a cumulative total claimed by the payer
    ///
    /// # Errors
    /// * `ChannelError::NonMonotonicPayment` - If `paid_so_far` does not exceed the current amount
    pub fn propose_total(&self, paid_so_far: Sats) -> Result<IncrementProposal> {
        if paid_so_far <= self.paid_so_far {
            return Err(ChannelError::NonMonotonicPayment {
                current: self.paid_so_far,
                proposed: paid_so_far,
            }
            .into());
        }
        self.propose_increment(paid_so_far - self.paid_so_far)
    }

    /// Verifies `signatures` over `proposal` and commits it
    ///
    /// Nothing changes unless every check passes.
    ///
    /// # Errors
    /// * `ChannelError::NonMonotonicPayment` - If the proposal does not supersede the current amount
    /// * `ChannelError::InvalidSignature` - If a signature does not verify
    /// * `ChannelError::MissingSignature` - If a required signature is absent
    pub fn accept_increment(
        &mut self,
        proposal: IncrementProposal,
        signatures: IncrementSignatures,
    ) -> Result<()> {
        if proposal.paid_so_far <= self.paid_so_far {
            return Err(ChannelError::NonMonotonicPayment {
                current: self.paid_so_far,
                proposed: proposal.paid_so_far,
            }
            .into());
        }

        let IncrementProposal { paid_so_far, mut refund, mut settlement, .. } = proposal;

        let settlement_payer = signatures
            .settlement_payer
            .ok_or_else(|| ChannelError::MissingSignature("payer settlement".to_string()))?;
        settlement.attach(&self.contract, Role::Client, settlement_payer)?;
        if let Some(sig) = signatures.settlement_payee {
            settlement.attach(&self.contract, Role::Server, sig)?;
        }

        match signatures.refund_payee {
            Some(sig) => refund.attach(&self.contract, Role::Server, sig)?,
            None if self.contract.version.countersigns_increments() => {
                return Err(ChannelError::MissingSignature("payee refund".to_string()).into());
            }
            None => {}
        }
        if let Some(sig) = signatures.refund_payer {
            refund.attach(&self.contract, Role::Client, sig)?;
        }

        self.paid_so_far = paid_so_far;
        self.refund = refund;
        self.settlement = settlement;
        Ok(())
    }

    /// Verifies and records a signature on the current refund
    pub fn sign_refund(&mut self, party: Role, signature: Signature) -> Result<()> {
        self.refund.attach(&self.contract, party, signature)
    }

    /// Verifies and records a signature on the current settlement
    pub fn sign_settlement(&mut self, party: Role, signature: Signature) -> Result<()> {
        self.settlement.attach(&self.contract, party, signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::test_utils::{funded_contract, payee_secret, payer_secret, sign_digest};
    use crate::errors::Error;
    use crate::protocol::version::ProtocolVersion;

    fn sign(proposal: &IncrementProposal, contract: &ChannelContract) -> IncrementSignatures {
        let settlement_digest = proposal.settlement.sighash(contract).expect("sighash");
        let refund_digest = proposal.refund.sighash(contract).expect("sighash");
        IncrementSignatures {
            settlement_payer: Some(sign_digest(&payer_secret(), settlement_digest)),
            settlement_payee: Some(sign_digest(&payee_secret(), settlement_digest)),
            refund_payer: Some(sign_digest(&payer_secret(), refund_digest)),
            refund_payee: Some(sign_digest(&payee_secret(), refund_digest)),
        }
    }

    fn pay(ledger: &mut Ledger, amount: Sats) -> Result<()> {
        let proposal = ledger.propose_increment(amount)?;
        let signatures = sign(&proposal, ledger.contract());
        ledger.accept_increment(proposal, signatures)
    }

    #[test]
    fn test_five_increments() {
        let mut ledger =
            Ledger::new(funded_contract(ProtocolVersion::V1, 100), 0).expect("ledger");
        for expected in [10, 20, 30, 40, 50] {
            pay(&mut ledger, 10).expect("increment within range");
            assert_eq!(ledger.paid_so_far(), expected);
        }
        assert_eq!(ledger.remaining(), 50);
        assert_eq!(ledger.refund().paid_so_far, 50);
        assert!(ledger.settlement().is_complete(ledger.contract()));
    }

    #[test]
    fn test_out_of_range_leaves_ledger() {
        let mut ledger =
            Ledger::new(funded_contract(ProtocolVersion::V2, 100), 0).expect("ledger");
        pay(&mut ledger, 95).expect("95 fits");

        let err = ledger.propose_increment(10).expect_err("105 > 100");
        assert!(matches!(
            err,
            Error::Channel(ChannelError::ValueOutOfRange { paid: 95, amount: 10, total: 100 })
        ));
        assert_eq!(ledger.paid_so_far(), 95);

        let err = ledger.propose_increment(u64::MAX).expect_err("overflow");
        assert!(matches!(err, Error::Channel(ChannelError::ValueOutOfRange { .. })));

        let err = ledger.propose_increment(0).expect_err("zero");
        assert!(matches!(err, Error::Channel(ChannelError::ZeroIncrement)));
    }

    #[test]
    fn test_stale_proposal_is_non_monotonic() {
        let mut ledger =
            Ledger::new(funded_contract(ProtocolVersion::V2, 100), 0).expect("ledger");
        let stale = ledger.propose_increment(10).expect("proposal");
        let stale_sigs = sign(&stale, ledger.contract());
        pay(&mut ledger, 20).expect("increment");

        let err = ledger.accept_increment(stale, stale_sigs).expect_err("10 < 20");
        assert!(matches!(
            err,
            Error::Channel(ChannelError::NonMonotonicPayment { current: 20, proposed: 10 })
        ));

        let err = ledger.propose_total(20).expect_err("same total");
        assert!(matches!(err, Error::Channel(ChannelError::NonMonotonicPayment { .. })));
        assert_eq!(ledger.propose_total(25).expect("greater total").amount, 5);
    }

    #[test]
    fn test_bad_signature_rejected() {
        let mut ledger =
            Ledger::new(funded_contract(ProtocolVersion::V1, 100), 0).expect("ledger");
        let proposal = ledger.propose_increment(10).expect("proposal");
        let mut signatures = sign(&proposal, ledger.contract());
        // Payer signs the refund digest instead of the settlement digest
        signatures.settlement_payer = signatures.refund_payer;

        let err = ledger.accept_increment(proposal, signatures).expect_err("wrong digest");
        assert!(matches!(err, Error::Channel(ChannelError::InvalidSignature(_))));
        assert_eq!(ledger.paid_so_far(), 0);
    }

    #[test]
    fn test_countersignature_required_only_for_multisig() {
        for (version, required) in [(ProtocolVersion::V1, true), (ProtocolVersion::V2, false)] {
            let mut ledger = Ledger::new(funded_contract(version, 100), 0).expect("ledger");
            let proposal = ledger.propose_increment(10).expect("proposal");
            let mut signatures = sign(&proposal, ledger.contract());
            signatures.refund_payee = None;

            let result = ledger.accept_increment(proposal, signatures);
            assert_eq!(result.is_err(), required, "{version:?}");
        }
    }
}
