//! Assembles covenant transactions.
//!
//! A covenant transaction spends covenant inputs followed by fee inputs, and creates the state
//! commitment at output `0`, covenant outputs after it, and an optional change output last. The
//! builder sizes the fee against a dummy transaction with witnesses of the final size, then
//! [`CovenantTxBuilder::calculate_input_ctxs`] grinds the trailing sequence until every covenant
//! input has a bindable preimage.

use bitcoin::{
    secp256k1::Keypair, Address, Amount, FeeRate, Sequence, TapLeafHash, Transaction, TxOut, Txid,
    Witness,
};
use catbridge_covenants::{
    preimage::SHPreimage,
    scripts::CovenantScript,
    tx::{state_output, CovenantTxOut, Prevout},
    Covenant, CovenantError, CovenantResult, SpendContext,
};
use catbridge_primitives::{amount::encode_amount, buf::Buf32, utxo::Utxo};
use tracing::{debug, trace};

use crate::{
    constants::{GRIND_SEQUENCE_START, MAX_GRIND_ATTEMPTS, MAX_INPUTS, MAX_OUTPUTS, P2TR_DUST_LIMIT},
    errors::{TxBuilderError, TxBuilderResult},
    operations::{create_tx, create_tx_ins, key_spend_dummy_witness},
};

/// An input of a draft transaction.
#[derive(Debug, Clone)]
enum DraftInput {
    /// A covenant output, unlocked through its leaf script.
    Covenant {
        utxo: Utxo,
        script: CovenantScript,
        calldata_len: usize,
    },

    /// A key-path output of the fee wallet.
    Fee { utxo: Utxo },
}

impl DraftInput {
    fn utxo(&self) -> &Utxo {
        match self {
            Self::Covenant { utxo, .. } | Self::Fee { utxo } => utxo,
        }
    }

    fn dummy_witness(&self) -> CovenantResult<Witness> {
        match self {
            Self::Covenant {
                script,
                calldata_len,
                ..
            } => script.dummy_witness(*calldata_len),
            Self::Fee { .. } => Ok(key_spend_dummy_witness()),
        }
    }
}

/// A builder for covenant transactions.
#[derive(Debug, Clone, Default)]
pub struct CovenantTxBuilder {
    inputs: Vec<DraftInput>,
    outputs: Vec<TxOut>,
    change: Option<TxOut>,
}

impl CovenantTxBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    fn push_input(&mut self, input: DraftInput) -> TxBuilderResult<()> {
        if self.inputs.len() >= MAX_INPUTS {
            return Err(TxBuilderError::TooManyInputs(self.inputs.len() + 1));
        }
        self.inputs.push(input);
        Ok(())
    }

    fn push_output(&mut self, output: TxOut) -> TxBuilderResult<()> {
        if self.outputs.len() >= MAX_OUTPUTS {
            return Err(TxBuilderError::TooManyOutputs(self.outputs.len() + 1));
        }
        self.outputs.push(output);
        Ok(())
    }

    /// Spends a covenant output through the leaf of `script`.
    ///
    /// `calldata_len` is the encoded size of the call that will unlock it, see
    /// [`calldata_len`](crate::operations::calldata_len).
    pub fn add_covenant_input(
        &mut self,
        utxo: Utxo,
        script: &CovenantScript,
        calldata_len: usize,
    ) -> TxBuilderResult<&mut Self> {
        if utxo.script_pubkey != script.script_pubkey() {
            return Err(TxBuilderError::ScriptMismatch(self.inputs.len()));
        }
        self.push_input(DraftInput::Covenant {
            utxo,
            script: script.clone(),
            calldata_len,
        })?;
        Ok(self)
    }

    /// Spends key-path outputs of the fee wallet.
    pub fn add_fee_inputs(
        &mut self,
        utxos: impl IntoIterator<Item = Utxo>,
    ) -> TxBuilderResult<&mut Self> {
        for utxo in utxos {
            self.push_input(DraftInput::Fee { utxo })?;
        }
        Ok(self)
    }

    /// Adds the state commitment; must be the first output.
    pub fn add_state_output(&mut self, hashes: &[Buf32]) -> TxBuilderResult<&mut Self> {
        if !self.outputs.is_empty() {
            return Err(TxBuilderError::StateOutputNotFirst);
        }
        self.push_output(state_output(hashes)?)?;
        Ok(self)
    }

    /// Adds a contract output of `covenant` holding `amount`.
    pub fn add_covenant_output<C: Covenant>(
        &mut self,
        covenant: &C,
        amount: u64,
    ) -> TxBuilderResult<&mut Self> {
        encode_amount(amount).map_err(CovenantError::from)?;
        self.push_output(covenant.contract_output(amount))?;
        Ok(self)
    }

    /// Adds any other output, such as a withdrawal payout.
    pub fn add_output(&mut self, output: TxOut) -> TxBuilderResult<&mut Self> {
        self.push_output(output)?;
        Ok(self)
    }

    /// Sum of all input values.
    pub fn input_value(&self) -> Amount {
        self.inputs.iter().map(|input| input.utxo().value).sum()
    }

    /// Sum of all output values, change excluded.
    pub fn output_value(&self) -> Amount {
        self.outputs.iter().map(|output| output.value).sum()
    }

    /// Estimated virtual size of the signed transaction, with `change` if given.
    pub fn estimate_vsize(&self, change: Option<&TxOut>) -> TxBuilderResult<usize> {
        let mut tx = self.unsigned_tx(change.cloned());
        for (txin, input) in tx.input.iter_mut().zip(&self.inputs) {
            txin.witness = input.dummy_witness()?;
        }
        Ok(tx.vsize())
    }

    fn fee(&self, change: Option<&TxOut>, fee_rate: FeeRate) -> TxBuilderResult<Amount> {
        let vsize = self.estimate_vsize(change)?;
        fee_rate
            .fee_vb(vsize as u64)
            .ok_or(TxBuilderError::FeeOverflow { vsize })
    }

    /// Pays whatever the inputs hold beyond the outputs and the fee to `address`.
    ///
    /// Change below the dust limit is left to the miner. Fails if the inputs do not cover the
    /// outputs and the fee.
    pub fn change(
        &mut self,
        address: &Address,
        fee_rate: FeeRate,
    ) -> TxBuilderResult<Option<&TxOut>> {
        self.change = None;

        let available = self.input_value();
        let spent = self.output_value();

        if self.outputs.len() < MAX_OUTPUTS {
            let placeholder = TxOut {
                value: Amount::ZERO,
                script_pubkey: address.script_pubkey(),
            };
            let fee = self.fee(Some(&placeholder), fee_rate)?;
            if let Some(value) = available
                .checked_sub(spent)
                .and_then(|left| left.checked_sub(fee))
                .filter(|value| *value >= P2TR_DUST_LIMIT)
            {
                debug!(%value, %fee, "paying change");
                self.change = Some(TxOut {
                    value,
                    script_pubkey: placeholder.script_pubkey,
                });
                return Ok(self.change.as_ref());
            }
        }

        let fee = self.fee(None, fee_rate)?;
        let needed = spent.checked_add(fee).unwrap_or(Amount::MAX);
        if available < needed {
            return Err(TxBuilderError::InsufficientFunds { needed, available });
        }

        debug!(dropped = %(available - needed), %fee, "change below dust, no change output");
        Ok(None)
    }

    /// The change output, as carried in covenant calldata.
    pub fn change_output(&self) -> Option<CovenantTxOut> {
        self.change.as_ref().map(CovenantTxOut::from)
    }

    /// Outpoints of the fee inputs, as carried in covenant calldata.
    pub fn fee_prevouts(&self) -> Vec<Prevout> {
        self.inputs
            .iter()
            .filter(|input| matches!(input, DraftInput::Fee { .. }))
            .map(|input| input.utxo().outpoint().into())
            .collect()
    }

    fn unsigned_tx(&self, change: Option<TxOut>) -> Transaction {
        let tx_ins = create_tx_ins(self.inputs.iter().map(|input| input.utxo().outpoint()));
        let mut tx_outs = self.outputs.clone();
        tx_outs.extend(change);

        let mut tx = create_tx(tx_ins, tx_outs);
        if let Some(last) = tx.input.last_mut() {
            last.sequence = Sequence(GRIND_SEQUENCE_START);
        }
        tx
    }

    /// Fixes the transaction and computes the preimage of every covenant input.
    ///
    /// All inputs share one search space: the trailing input's sequence is incremented until every
    /// covenant input is bindable at once.
    pub fn calculate_input_ctxs(&self) -> TxBuilderResult<CovenantTxDraft> {
        if self.inputs.is_empty() {
            return Err(TxBuilderError::NoInputs);
        }

        let prevouts: Vec<TxOut> = self.inputs.iter().map(|i| i.utxo().txout()).collect();
        let leaves: Vec<(usize, TapLeafHash)> = self
            .inputs
            .iter()
            .enumerate()
            .filter_map(|(index, input)| match input {
                DraftInput::Covenant { script, .. } => Some((index, script.leaf_hash())),
                DraftInput::Fee { .. } => None,
            })
            .collect();

        let mut tx = self.unsigned_tx(self.change.clone());
        let last = tx.input.len() - 1;

        for attempt in 0..MAX_GRIND_ATTEMPTS {
            tx.input[last].sequence = Sequence(GRIND_SEQUENCE_START + attempt);

            let preimages = leaves
                .iter()
                .map(|(index, leaf)| SHPreimage::from_tx(&tx, &prevouts, *index, *leaf))
                .collect::<CovenantResult<Vec<_>>>()?;

            if preimages.iter().all(SHPreimage::is_bindable) {
                trace!(%attempt, covenant_inputs = leaves.len(), "found bindable preimages");
                return Ok(CovenantTxDraft {
                    tx,
                    prevouts,
                    inputs: self.inputs.clone(),
                });
            }
        }

        Err(TxBuilderError::NoValidPreimageFound(MAX_GRIND_ATTEMPTS))
    }
}

/// A transaction whose inputs and outputs are fixed, awaiting its witnesses.
#[derive(Debug, Clone)]
pub struct CovenantTxDraft {
    tx: Transaction,
    prevouts: Vec<TxOut>,
    inputs: Vec<DraftInput>,
}

impl CovenantTxDraft {
    /// The transaction with the witnesses attached so far.
    pub fn tx(&self) -> &Transaction {
        &self.tx
    }

    /// The id of the transaction; witnesses do not change it.
    pub fn txid(&self) -> Txid {
        self.tx.compute_txid()
    }

    /// The outputs spent by each input, in order.
    pub fn prevouts(&self) -> &[TxOut] {
        &self.prevouts
    }

    /// The context a covenant method sees when unlocking input `index`.
    pub fn input_ctx(&self, index: usize) -> TxBuilderResult<SpendContext<'_>> {
        let script = self.covenant_script(index)?;
        Ok(SpendContext::new(&self.tx, &self.prevouts, index, script)?)
    }

    fn covenant_script(&self, index: usize) -> TxBuilderResult<&CovenantScript> {
        match self.inputs.get(index) {
            Some(DraftInput::Covenant { script, .. }) => Ok(script),
            _ => Err(TxBuilderError::NotCovenantInput(index)),
        }
    }

    /// Evaluates `call` on `covenant` for input `index` and attaches the resulting witness.
    pub fn update_covenant_input<C: Covenant>(
        &mut self,
        index: usize,
        covenant: &C,
        call: &C::Call,
        operator: &Keypair,
    ) -> TxBuilderResult<()> {
        if self.covenant_script(index)?.script_pubkey() != covenant.script_pubkey() {
            return Err(TxBuilderError::ScriptMismatch(index));
        }

        let witness = {
            let ctx = SpendContext::new(&self.tx, &self.prevouts, index, covenant.script())?;
            covenant.unlock(call, &ctx, operator)?
        };

        trace!(covenant = C::NAME, %index, "attached covenant witness");
        self.tx.input[index].witness = witness;
        Ok(())
    }

    /// Hands the transaction over for the fee inputs to be signed.
    pub fn into_signing_data(self) -> TxSigningData {
        let key_spend_inputs = self
            .inputs
            .iter()
            .enumerate()
            .filter(|(_, input)| matches!(input, DraftInput::Fee { .. }))
            .map(|(index, _)| index)
            .collect();

        TxSigningData {
            tx: self.tx,
            prevouts: self.prevouts,
            key_spend_inputs,
        }
    }
}

/// Everything a signer needs to complete a covenant transaction.
#[derive(Debug, Clone)]
pub struct TxSigningData {
    /// The transaction, covenant witnesses already attached.
    pub tx: Transaction,

    /// The outputs spent by each input, in order.
    pub prevouts: Vec<TxOut>,

    /// Inputs to be signed on the key path by the fee wallet.
    pub key_spend_inputs: Vec<usize>,
}

#[cfg(test)]
mod tests {
    use bitcoin::Network;
    use catbridge_covenants::{
        deposit_aggregator::{DepositAggregatorCall, AGGREGATOR_VOUT},
        tx::CovenantTx,
        CovenantSet,
    };
    use catbridge_merkle::aggregation::AggregationNode;
    use catbridge_test_utils::{
        bitcoin::{funding_tx, generate_keypair, random_p2tr_script},
        random_buf32,
    };

    use super::*;
    use crate::operations::{calldata_len, key_spend_address};

    const DEPOSIT: u64 = 100_000_000;
    const FEE_UTXO: u64 = 100_000;

    fn fee_utxo(value: u64) -> Utxo {
        let tx = funding_tx(vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: random_p2tr_script(),
        }]);
        Utxo::from_tx_output(&tx, 0).unwrap()
    }

    fn deposit(set: &CovenantSet) -> (CovenantTx, AggregationNode) {
        let node = AggregationNode::leaf(random_buf32(), DEPOSIT);
        let tx = funding_tx(vec![
            state_output(&[node.hash().unwrap()]).unwrap(),
            set.deposit_aggregator.contract_output(DEPOSIT),
        ]);
        (CovenantTx::from_transaction(&tx), node)
    }

    fn aggregator_utxo(tx: &CovenantTx) -> Utxo {
        Utxo::from_tx_output(&tx.to_transaction(), AGGREGATOR_VOUT).unwrap()
    }

    fn change_address() -> Address {
        key_spend_address(generate_keypair().x_only_public_key().0, Network::Regtest)
    }

    #[test]
    fn test_aggregate_end_to_end() {
        let operator = generate_keypair();
        let set = CovenantSet::derive(&operator.x_only_public_key().0, Network::Regtest).unwrap();
        let agg = &set.deposit_aggregator;
        let (tx0, node0) = deposit(&set);
        let (tx1, node1) = deposit(&set);
        let merged = AggregationNode::merge(&node0, &node1).unwrap();
        let fee = fee_utxo(FEE_UTXO);
        let address = change_address();

        let call = |fee_prevouts: Vec<Prevout>, change: Option<CovenantTxOut>| {
            DepositAggregatorCall::Aggregate {
                prev_tx0: tx0.clone(),
                prev_tx1: tx1.clone(),
                state0: node0.clone(),
                state1: node1.clone(),
                ancestors: vec![],
                fee_prevouts,
                change,
            }
        };
        let draft_change = CovenantTxOut {
            value: 0,
            script: address.script_pubkey().to_bytes(),
        };
        let len = calldata_len(&call(vec![fee.outpoint().into()], Some(draft_change))).unwrap();

        let mut builder = CovenantTxBuilder::new();
        builder
            .add_covenant_input(aggregator_utxo(&tx0), agg.script(), len)
            .unwrap()
            .add_covenant_input(aggregator_utxo(&tx1), agg.script(), len)
            .unwrap()
            .add_fee_inputs([fee])
            .unwrap()
            .add_state_output(&[merged.hash().unwrap()])
            .unwrap()
            .add_covenant_output(agg, 2 * DEPOSIT)
            .unwrap();
        let change = builder
            .change(&address, FeeRate::from_sat_per_vb(2).unwrap())
            .unwrap()
            .cloned()
            .unwrap();
        assert!(change.value < Amount::from_sat(FEE_UTXO));
        let estimate = builder.estimate_vsize(Some(&change)).unwrap();

        let call = call(builder.fee_prevouts(), builder.change_output());
        let mut draft = builder.calculate_input_ctxs().unwrap();
        for index in 0..2 {
            assert!(draft.input_ctx(index).unwrap().preimage().is_bindable());
            draft
                .update_covenant_input(index, agg, &call, &operator)
                .unwrap();
        }
        assert!(matches!(
            draft.input_ctx(2),
            Err(TxBuilderError::NotCovenantInput(2))
        ));

        for index in 0..2 {
            set.verify_input(draft.tx(), draft.prevouts(), index).unwrap();
        }

        // the estimate covers the final witnesses
        let mut signed = draft.tx().clone();
        signed.input[2].witness = key_spend_dummy_witness();
        assert!(estimate >= signed.vsize());

        let signing = draft.into_signing_data();
        assert_eq!(signing.key_spend_inputs, vec![2]);
    }

    #[test]
    fn test_insufficient_funds() {
        let operator = generate_keypair();
        let set = CovenantSet::derive(&operator.x_only_public_key().0, Network::Regtest).unwrap();
        let (tx0, _) = deposit(&set);

        let mut builder = CovenantTxBuilder::new();
        builder
            .add_covenant_input(aggregator_utxo(&tx0), set.deposit_aggregator.script(), 600)
            .unwrap()
            .add_fee_inputs([fee_utxo(100)])
            .unwrap()
            .add_state_output(&[Buf32::zero()])
            .unwrap()
            .add_covenant_output(&set.deposit_aggregator, DEPOSIT)
            .unwrap();

        assert!(matches!(
            builder.change(&change_address(), FeeRate::from_sat_per_vb(1).unwrap()),
            Err(TxBuilderError::InsufficientFunds { .. })
        ));
    }

    #[test]
    fn test_dust_change_is_dropped() {
        let mut builder = CovenantTxBuilder::new();
        builder
            .add_fee_inputs([fee_utxo(10_000)])
            .unwrap()
            .add_output(TxOut {
                value: Amount::from_sat(9_500),
                script_pubkey: random_p2tr_script(),
            })
            .unwrap();

        let change = builder
            .change(&change_address(), FeeRate::from_sat_per_vb(1).unwrap())
            .unwrap();
        assert!(change.is_none());
        assert!(builder.change_output().is_none());
    }

    #[test]
    fn test_input_and_output_caps() {
        let mut builder = CovenantTxBuilder::new();
        builder
            .add_fee_inputs((0..MAX_INPUTS).map(|_| fee_utxo(1_000)))
            .unwrap();
        assert!(matches!(
            builder.add_fee_inputs([fee_utxo(1_000)]),
            Err(TxBuilderError::TooManyInputs(7))
        ));

        for _ in 0..MAX_OUTPUTS {
            builder
                .add_output(TxOut {
                    value: Amount::from_sat(1_000),
                    script_pubkey: random_p2tr_script(),
                })
                .unwrap();
        }
        assert!(matches!(
            builder.add_output(TxOut::NULL),
            Err(TxBuilderError::TooManyOutputs(7))
        ));
    }

    #[test]
    fn test_state_output_must_be_first() {
        let mut builder = CovenantTxBuilder::new();
        builder
            .add_output(TxOut {
                value: Amount::from_sat(1_000),
                script_pubkey: random_p2tr_script(),
            })
            .unwrap();

        assert!(matches!(
            builder.add_state_output(&[Buf32::zero()]),
            Err(TxBuilderError::StateOutputNotFirst)
        ));
    }

    #[test]
    fn test_covenant_input_script_checked() {
        let operator = generate_keypair();
        let set = CovenantSet::derive(&operator.x_only_public_key().0, Network::Regtest).unwrap();

        assert!(matches!(
            CovenantTxBuilder::new().add_covenant_input(fee_utxo(1_000), set.bridge.script(), 0),
            Err(TxBuilderError::ScriptMismatch(0))
        ));
    }
}
