//! Turns a planned spend into a signed transaction.

use bitcoin::{hashes::Hash, secp256k1::Keypair, Amount, Transaction, TxOut, Txid};
use catbridge_btcio::{ChainProvider, SignRequest, Signer, UtxoProvider, UtxoQuery};
use catbridge_covenants::{
    bridge::BridgeCall,
    deposit_aggregator::DepositAggregatorCall,
    scripts::CovenantScript,
    tx::{CovenantTxOut, Prevout},
    withdrawal_expander::WithdrawalExpanderCall,
    Covenant, CovenantSet,
};
use catbridge_primitives::{buf::Buf32, utxo::Utxo};
use catbridge_tx_builder::{
    constants::MAX_INPUTS,
    prelude::{calldata_len, CovenantTxBuilder, CovenantTxDraft, TxBuilderResult},
};
use tracing::*;

use super::BridgeOperator;
use crate::errors::{ExecError, ExecResult};

/// The covenant method unlocking one input.
#[derive(Debug, Clone)]
pub(crate) enum InputCall {
    Bridge(BridgeCall),
    Aggregator(DepositAggregatorCall),
    Expander(WithdrawalExpanderCall),
}

impl InputCall {
    fn script<'a>(&self, covenants: &'a CovenantSet) -> &'a CovenantScript {
        match self {
            Self::Bridge(_) => covenants.bridge.script(),
            Self::Aggregator(_) => covenants.deposit_aggregator.script(),
            Self::Expander(_) => covenants.withdrawal_expander.script(),
        }
    }

    fn calldata_len(&self) -> TxBuilderResult<usize> {
        match self {
            Self::Bridge(call) => calldata_len(call),
            Self::Aggregator(call) => calldata_len(call),
            Self::Expander(call) => calldata_len(call),
        }
    }

    fn unlock(
        &self,
        draft: &mut CovenantTxDraft,
        index: usize,
        covenants: &CovenantSet,
        operator: &Keypair,
    ) -> TxBuilderResult<()> {
        match self {
            Self::Bridge(call) => {
                draft.update_covenant_input(index, &covenants.bridge, call, operator)
            }
            Self::Aggregator(call) => {
                draft.update_covenant_input(index, &covenants.deposit_aggregator, call, operator)
            }
            Self::Expander(call) => {
                draft.update_covenant_input(index, &covenants.withdrawal_expander, call, operator)
            }
        }
    }
}

/// Which covenant a contract output is locked by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CovenantKind {
    Bridge,
    DepositAggregator,
    WithdrawalExpander,
}

/// An output of a planned spend, after the state commitment.
#[derive(Debug, Clone)]
pub(crate) enum PlannedOutput {
    Contract(CovenantKind, u64),
    Payout(TxOut),
}

/// The covenant inputs and the outputs of a spend; fee inputs and change are added on assembly.
#[derive(Debug, Clone, Default)]
pub(crate) struct TxPlan {
    pub(crate) covenant_inputs: Vec<Utxo>,
    pub(crate) state: Vec<Buf32>,
    pub(crate) outputs: Vec<PlannedOutput>,
}

impl TxPlan {
    fn builder(
        &self,
        covenants: &CovenantSet,
        calls: &[InputCall],
        fee_utxos: Vec<Utxo>,
    ) -> ExecResult<CovenantTxBuilder> {
        if calls.len() != self.covenant_inputs.len() {
            return Err(ExecError::Validation(format!(
                "{} covenant inputs but {} calls",
                self.covenant_inputs.len(),
                calls.len()
            )));
        }

        let mut builder = CovenantTxBuilder::new();
        for (utxo, call) in self.covenant_inputs.iter().zip(calls) {
            builder.add_covenant_input(utxo.clone(), call.script(covenants), call.calldata_len()?)?;
        }
        builder.add_fee_inputs(fee_utxos)?;

        if !self.state.is_empty() {
            builder.add_state_output(&self.state)?;
        }
        for output in &self.outputs {
            match output {
                PlannedOutput::Contract(CovenantKind::Bridge, amount) => {
                    builder.add_covenant_output(&covenants.bridge, *amount)?
                }
                PlannedOutput::Contract(CovenantKind::DepositAggregator, amount) => {
                    builder.add_covenant_output(&covenants.deposit_aggregator, *amount)?
                }
                PlannedOutput::Contract(CovenantKind::WithdrawalExpander, amount) => {
                    builder.add_covenant_output(&covenants.withdrawal_expander, *amount)?
                }
                PlannedOutput::Payout(txout) => builder.add_output(txout.clone())?,
            };
        }

        Ok(builder)
    }
}

impl<C, U, S> BridgeOperator<C, U, S>
where
    C: ChainProvider,
    U: UtxoProvider,
    S: Signer,
{
    /// Funds, unlocks and signs the spend described by `plan`.
    ///
    /// `calls` produces the call unlocking each covenant input, in input order, for the given fee
    /// inputs and change output. It is evaluated three times: with a placeholder fee input to size
    /// the fee, with the selected fee inputs to size the calldata, and with the final fee inputs
    /// and change for the witnesses.
    pub(crate) async fn assemble<F>(&self, plan: TxPlan, calls: F) -> ExecResult<Transaction>
    where
        F: Fn(Vec<Prevout>, Option<CovenantTxOut>) -> Vec<InputCall>,
    {
        let address = self.signer.address();
        let change_spk = address.script_pubkey();
        let draft_change = Some(CovenantTxOut {
            value: 0,
            script: change_spk.to_bytes(),
        });

        let placeholder = Utxo::new(Txid::all_zeros(), 0, change_spk.clone(), Amount::ZERO);
        let sizing = plan.builder(
            &self.covenants,
            &calls(vec![placeholder.outpoint().into()], draft_change.clone()),
            vec![placeholder],
        )?;
        let vsize = sizing.estimate_vsize(Some(&TxOut {
            value: Amount::ZERO,
            script_pubkey: change_spk,
        }))?;
        let fee = self.fee_rate.fee_vb(vsize as u64).ok_or_else(|| {
            ExecError::Validation(format!("fee overflow at {vsize} vbytes"))
        })?;

        let needed = sizing.output_value() + fee;
        let deficit = needed
            .checked_sub(sizing.input_value())
            .unwrap_or(Amount::ZERO);

        // every extra fee input grows the fee, the second `fee` leaves room for them
        let query = UtxoQuery {
            total: Some(deficit + fee),
            max_count: Some(MAX_INPUTS.saturating_sub(plan.covenant_inputs.len())),
        };
        let fee_utxos = self.utxos.get_utxos(&address, query).await?;
        if fee_utxos.is_empty() {
            return Err(ExecError::InsufficientFunds {
                needed: deficit,
                available: Amount::ZERO,
            });
        }
        debug!(%vsize, %fee, fee_inputs = fee_utxos.len(), "selected fee inputs");

        let fee_prevouts = fee_utxos.iter().map(|utxo| utxo.outpoint().into()).collect();
        let mut builder = plan.builder(
            &self.covenants,
            &calls(fee_prevouts, draft_change),
            fee_utxos,
        )?;
        builder.change(&address, self.fee_rate)?;

        let calls = calls(builder.fee_prevouts(), builder.change_output());
        let mut draft = builder.calculate_input_ctxs()?;
        for (index, call) in calls.iter().enumerate() {
            call.unlock(&mut draft, index, &self.covenants, &self.operator)?;
        }

        let signing = draft.into_signing_data();
        let tx = self
            .signer
            .sign_tx(SignRequest {
                tx: signing.tx,
                prevouts: signing.prevouts,
                inputs: signing.key_spend_inputs,
            })
            .await?;

        trace!(txid = %tx.compute_txid(), vsize = tx.vsize(), "assembled covenant transaction");
        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::test_utils::{operator, FEE_UTXO};

    #[tokio::test]
    async fn test_empty_wallet_is_insufficient() {
        let (operator, _chain) = operator(0);
        let plan = TxPlan {
            state: vec![Buf32::zero()],
            outputs: vec![PlannedOutput::Contract(CovenantKind::Bridge, 1_000)],
            ..Default::default()
        };

        assert!(matches!(
            operator.assemble(plan, |_, _| Vec::new()).await,
            Err(ExecError::InsufficientFunds { .. })
        ));
    }

    #[tokio::test]
    async fn test_fee_inputs_cover_outputs() {
        let (operator, chain) = operator(3);
        let plan = TxPlan {
            state: vec![Buf32::zero()],
            outputs: vec![PlannedOutput::Contract(
                CovenantKind::DepositAggregator,
                2 * FEE_UTXO,
            )],
            ..Default::default()
        };

        let tx = operator.assemble(plan, |_, _| Vec::new()).await.unwrap();
        assert_eq!(tx.input.len(), 3);
        assert_eq!(tx.output[1].value, Amount::from_sat(2 * FEE_UTXO));

        let fee = Amount::from_sat(3 * FEE_UTXO)
            - tx.output.iter().map(|out| out.value).sum::<Amount>();
        assert!(fee >= operator.fee_rate.fee_vb(tx.vsize() as u64).unwrap());

        chain.broadcast(&tx).await.unwrap();
        let address = operator.signer.address();
        assert!(chain
            .get_utxos(&address, UtxoQuery::default())
            .await
            .unwrap()
            .iter()
            .all(|utxo| utxo.txid == tx.compute_txid()));
    }

    #[tokio::test]
    async fn test_mismatched_calls_are_rejected() {
        let (operator, _chain) = operator(1);
        let plan = TxPlan {
            covenant_inputs: vec![Utxo::new(
                Txid::all_zeros(),
                1,
                operator.covenants.bridge.script_pubkey(),
                Amount::from_sat(1_000),
            )],
            state: vec![Buf32::zero()],
            outputs: vec![PlannedOutput::Contract(CovenantKind::Bridge, 1_000)],
        };

        assert!(matches!(
            operator.assemble(plan, |_, _| Vec::new()).await,
            Err(ExecError::Validation(_))
        ));
    }
}
