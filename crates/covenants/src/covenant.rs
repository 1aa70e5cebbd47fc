//! The [`Covenant`] trait and the context a covenant method is evaluated in.

use std::fmt;

use bitcoin::{
    secp256k1::{Keypair, Message, XOnlyPublicKey, SECP256K1},
    OutPoint, ScriptBuf, Transaction, TxOut, Witness,
};
use borsh::{BorshDeserialize, BorshSerialize};
use catbridge_primitives::constants::PREIMAGE_BINDING_PUBKEY;
use tracing::{debug, trace};

use crate::{
    errors::{CovenantError, CovenantResult},
    preimage::{hash_outputs, hash_prevouts, script_spend_sighash, SHPreimage},
    scripts::{CovenantScript, CovenantWitness},
    tx::{contract_output, CovenantTxOut, Prevout},
};

/// Everything a covenant method can observe about the spend it is evaluated for.
///
/// Methods only read [`Self::preimage`], mirroring what the script sees. The full transaction is
/// kept so that the preimage can be recomputed and signed.
#[derive(Debug)]
pub struct SpendContext<'a> {
    tx: &'a Transaction,
    prevouts: &'a [TxOut],
    input_index: usize,
    preimage: SHPreimage,
}

impl<'a> SpendContext<'a> {
    /// Computes the context of input `input_index` spending the leaf of `script`.
    pub fn new(
        tx: &'a Transaction,
        prevouts: &'a [TxOut],
        input_index: usize,
        script: &CovenantScript,
    ) -> CovenantResult<Self> {
        let preimage = SHPreimage::from_tx(tx, prevouts, input_index, script.leaf_hash())?;
        Ok(Self {
            tx,
            prevouts,
            input_index,
            preimage,
        })
    }

    /// The transaction being built.
    pub fn tx(&self) -> &Transaction {
        self.tx
    }

    /// The outputs spent by the transaction.
    pub fn prevouts(&self) -> &[TxOut] {
        self.prevouts
    }

    /// The index of the input being unlocked.
    pub fn input_index(&self) -> usize {
        self.input_index
    }

    /// The sighash preimage of the input.
    pub fn preimage(&self) -> &SHPreimage {
        &self.preimage
    }

    /// Fails unless the covenant is being unlocked at `expected`.
    pub fn expect_input_index(&self, expected: usize) -> CovenantResult<()> {
        let got = self.preimage.input_index();
        if got != expected {
            return Err(CovenantError::InputIndex { expected, got });
        }
        Ok(())
    }

    /// Fails unless the transaction spends exactly `covenant_prevouts` followed by `fee_prevouts`.
    pub fn expect_prevouts(
        &self,
        covenant_prevouts: &[OutPoint],
        fee_prevouts: &[Prevout],
    ) -> CovenantResult<()> {
        let fees: Vec<OutPoint> = fee_prevouts.iter().copied().map(OutPoint::from).collect();
        let all: Vec<&OutPoint> = covenant_prevouts.iter().chain(fees.iter()).collect();

        if hash_prevouts(all) != self.preimage.sha_prevouts {
            return Err(CovenantError::PrevoutsMismatch);
        }
        Ok(())
    }

    /// Fails unless the transaction creates exactly `outputs` followed by the optional change.
    pub fn expect_outputs(
        &self,
        mut outputs: Vec<TxOut>,
        change: Option<&CovenantTxOut>,
    ) -> CovenantResult<()> {
        outputs.extend(change.map(TxOut::from));

        if hash_outputs(&outputs) != self.preimage.sha_outputs {
            trace!(?outputs, "expected outputs");
            return Err(CovenantError::OutputsMismatch);
        }
        Ok(())
    }
}

/// A covenant output type and its methods.
pub trait Covenant {
    /// The method call, pushed Borsh-encoded as calldata.
    type Call: BorshSerialize + BorshDeserialize + fmt::Debug;

    /// Human readable name.
    const NAME: &'static str;

    /// The derived locking script.
    fn script(&self) -> &CovenantScript;

    /// Checks that `call` is a valid transition for the spend described by `ctx`.
    fn check_call(&self, call: &Self::Call, ctx: &SpendContext<'_>) -> CovenantResult<()>;

    /// The locking script pubkey.
    fn script_pubkey(&self) -> ScriptBuf {
        self.script().script_pubkey()
    }

    /// A contract output of this covenant holding `amount`.
    fn contract_output(&self, amount: u64) -> TxOut {
        contract_output(&self.script_pubkey(), amount)
    }

    /// Evaluates `call` and produces the witness unlocking the input of `ctx`.
    fn unlock(
        &self,
        call: &Self::Call,
        ctx: &SpendContext<'_>,
        operator: &Keypair,
    ) -> CovenantResult<Witness> {
        ctx.preimage().check_preimage()?;
        self.check_call(call, ctx)?;

        let script = self.script();
        if operator.x_only_public_key().0 != *script.operator() {
            return Err(CovenantError::OperatorSignature);
        }

        let msg = Message::from_digest(ctx.preimage().sighash().0);
        let operator_sig = SECP256K1.sign_schnorr(&msg, operator);

        let calldata =
            borsh::to_vec(call).map_err(|e| CovenantError::Validation(e.to_string()))?;

        debug!(
            covenant = Self::NAME,
            input = ctx.input_index(),
            calldata_len = calldata.len(),
            "unlocked covenant input"
        );

        Ok(CovenantWitness {
            calldata,
            preimage: ctx.preimage().clone(),
            operator_sig,
            leaf_script: script.leaf_script().clone(),
            control_block: script.control_block()?,
        }
        .to_witness()?)
    }

    /// Verifies the spend of input `input_index` of `tx` as a call to this covenant.
    ///
    /// On top of [`verify_spend`], the witness must reveal this covenant's leaf and its calldata
    /// must decode to a [`Self::Call`] that is a valid transition for the spend.
    fn verify(
        &self,
        tx: &Transaction,
        prevouts: &[TxOut],
        input_index: usize,
    ) -> CovenantResult<Self::Call> {
        let script = self.script();
        let witness = verify_spend(tx, prevouts, input_index, script.operator())?;
        if witness.leaf_script != *script.leaf_script() {
            return Err(CovenantError::ScriptMismatch("leaf of another covenant"));
        }

        let call = <Self::Call as BorshDeserialize>::try_from_slice(&witness.calldata)
            .map_err(|e| CovenantError::MalformedWitness(format!("calldata: {e}")))?;
        let ctx = SpendContext::new(tx, prevouts, input_index, script)?;
        self.check_call(&call, &ctx)?;

        trace!(covenant = Self::NAME, input = input_index, ?call, "verified covenant call");
        Ok(call)
    }
}

/// Verifies the authorization of a covenant spend: the leaf is committed by the spent output, the
/// preimage matches the real sighash and binds under the generator, and the operator signed.
///
/// This says nothing about the transition itself; use [`Covenant::verify`] for that.
pub fn verify_spend(
    tx: &Transaction,
    prevouts: &[TxOut],
    input_index: usize,
    operator: &XOnlyPublicKey,
) -> CovenantResult<CovenantWitness> {
    let txin = tx.input.get(input_index).ok_or(CovenantError::InputIndex {
        expected: tx.input.len(),
        got: input_index,
    })?;
    let spent = prevouts
        .get(input_index)
        .ok_or(CovenantError::PrevoutsMismatch)?;
    let witness = CovenantWitness::from_witness(&txin.witness)?;

    let output_key = spent
        .script_pubkey
        .as_bytes()
        .get(2..34)
        .and_then(|key| XOnlyPublicKey::from_slice(key).ok())
        .ok_or(CovenantError::ScriptMismatch("spent output is not P2TR"))?;
    if !witness.control_block.verify_taproot_commitment(
        SECP256K1,
        output_key,
        &witness.leaf_script,
    ) {
        return Err(CovenantError::ScriptMismatch("leaf not committed by output"));
    }

    let leaf_hash = bitcoin::TapLeafHash::from_script(
        &witness.leaf_script,
        bitcoin::taproot::LeafVersion::TapScript,
    );
    let sighash = script_spend_sighash(tx, prevouts, input_index, leaf_hash)?;
    if witness.preimage.sighash() != sighash {
        return Err(CovenantError::PreimageMismatch);
    }

    let binding_sig = witness.preimage.check_preimage()?;
    let msg = Message::from_digest(sighash.0);
    SECP256K1
        .verify_schnorr(&binding_sig, &msg, &PREIMAGE_BINDING_PUBKEY)
        .map_err(|_| CovenantError::PreimageMismatch)?;
    SECP256K1
        .verify_schnorr(&witness.operator_sig, &msg, operator)
        .map_err(|_| CovenantError::OperatorSignature)?;

    Ok(witness)
}

/// Fails unless `actual` is the script `expected`.
pub(crate) fn expect_script(
    actual: &[u8],
    expected: &ScriptBuf,
    what: &'static str,
) -> CovenantResult<()> {
    if actual != expected.as_bytes() {
        return Err(CovenantError::ScriptMismatch(what));
    }
    Ok(())
}
