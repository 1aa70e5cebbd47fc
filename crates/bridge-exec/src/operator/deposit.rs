//! The deposit path: deploy, deposit, aggregate, finalize on L1 and L2.

use catbridge_btcio::{ChainProvider, Signer, UtxoProvider};
use catbridge_covenants::{
    bridge::{batch_id, BridgeCall, BRIDGE_VOUT},
    deposit_aggregator::{DepositAggregatorCall, AGGREGATOR_VOUT},
    state::{AggregationNode, BridgeState},
    Covenant,
};
use catbridge_primitives::{buf::Buf32, constants::EMPTY_BATCH_ID, utxo::CovenantUtxo};
use tracing::*;

use super::{
    assemble::{CovenantKind, InputCall, PlannedOutput, TxPlan},
    output_utxo, BridgeOperator, BridgeOutput, Built, DepositEntry, FinalizedDeposit,
};
use crate::errors::{ExecError, ExecResult};

impl<C, U, S> BridgeOperator<C, U, S>
where
    C: ChainProvider,
    U: UtxoProvider,
    S: Signer,
{
    /// Creates the genesis bridge output holding `amount`, every batch slot empty.
    pub async fn deploy_bridge(&self, amount: u64) -> ExecResult<Built<BridgeOutput>> {
        let state = BridgeState::new(self.covenants.deposit_aggregator.script_pubkey());
        let plan = TxPlan {
            state: vec![state.hash()],
            outputs: vec![PlannedOutput::Contract(CovenantKind::Bridge, amount)],
            ..Default::default()
        };

        let tx = self.assemble(plan, |_, _| Vec::new()).await?;
        let utxo = output_utxo(&tx, BRIDGE_VOUT)?;

        info!(txid = %tx.compute_txid(), %amount, "built bridge deployment");
        Ok(Built {
            tx,
            output: CovenantUtxo::new(state, utxo),
        })
    }

    /// Creates a level-0 aggregator output crediting `amount` to `l2_address`, paid from the fee
    /// wallet.
    pub async fn create_deposit(
        &self,
        l2_address: Buf32,
        amount: u64,
    ) -> ExecResult<Built<DepositEntry>> {
        if amount == 0 {
            return Err(ExecError::Validation("deposit of nothing".to_string()));
        }

        let node = AggregationNode::leaf(l2_address, amount);
        let plan = TxPlan {
            state: vec![node.hash()?],
            outputs: vec![PlannedOutput::Contract(CovenantKind::DepositAggregator, amount)],
            ..Default::default()
        };

        let tx = self.assemble(plan, |_, _| Vec::new()).await?;
        let utxo = output_utxo(&tx, AGGREGATOR_VOUT)?;

        info!(txid = %tx.compute_txid(), %l2_address, %amount, "built deposit");
        Ok(Built {
            tx,
            output: CovenantUtxo::new(node, utxo),
        })
    }

    /// Merges two sibling aggregator nodes into their parent.
    pub async fn aggregate(
        &self,
        left: &DepositEntry,
        right: &DepositEntry,
    ) -> ExecResult<Built<DepositEntry>> {
        if left.utxo.outpoint() == right.utxo.outpoint() {
            return Err(ExecError::Validation(
                "cannot aggregate a node with itself".to_string(),
            ));
        }
        let merged = AggregationNode::merge(&left.state, &right.state)?;

        let (trace0, trace1) = tokio::try_join!(
            self.backtracer.backtrace_aggregator(&left.utxo, &left.state),
            self.backtracer.backtrace_aggregator(&right.utxo, &right.state),
        )?;
        let ancestors: Vec<_> = trace0
            .ancestors
            .iter()
            .chain(&trace1.ancestors)
            .cloned()
            .collect();

        let total = left.utxo.value.to_sat() + right.utxo.value.to_sat();
        let plan = TxPlan {
            covenant_inputs: vec![left.utxo.clone(), right.utxo.clone()],
            state: vec![merged.hash()?],
            outputs: vec![PlannedOutput::Contract(CovenantKind::DepositAggregator, total)],
        };

        let tx = self
            .assemble(plan, |fee_prevouts, change| {
                let call = InputCall::Aggregator(DepositAggregatorCall::Aggregate {
                    prev_tx0: trace0.tx.clone(),
                    prev_tx1: trace1.tx.clone(),
                    state0: left.state.clone(),
                    state1: right.state.clone(),
                    ancestors: ancestors.clone(),
                    fee_prevouts,
                    change,
                });
                vec![call.clone(), call]
            })
            .await?;
        let utxo = output_utxo(&tx, AGGREGATOR_VOUT)?;

        info!(txid = %tx.compute_txid(), level = merged.level(), %total, "built aggregation");
        Ok(Built {
            tx,
            output: CovenantUtxo::new(merged, utxo),
        })
    }

    /// Merges the aggregator root `root` into the first empty slot of the bridge.
    pub async fn finalize_l1_deposit(
        &self,
        bridge: &BridgeOutput,
        root: &DepositEntry,
    ) -> ExecResult<Built<FinalizedDeposit>> {
        let (bridge_tx, trace) = tokio::try_join!(
            self.backtracer.backtrace_bridge(&bridge.utxo, &bridge.state),
            self.backtracer.backtrace_aggregator(&root.utxo, &root.state),
        )?;

        let id = batch_id(trace.tx.txid(), &root.state.hash()?);
        let batches = &bridge.state.batches;
        if let Some(slot) = batches.position_of(&id) {
            return Err(ExecError::Validation(format!(
                "batch {id} already finalized at slot {slot}"
            )));
        }
        let slot = batches
            .first_empty_slot()
            .ok_or_else(|| ExecError::Validation("no empty batch slot".to_string()))?;
        let proof = batches.proof(slot)?;
        let next = bridge.state.with_slot(slot, id)?;

        let amount = bridge.utxo.value.to_sat() + root.utxo.value.to_sat();
        let plan = TxPlan {
            covenant_inputs: vec![bridge.utxo.clone(), root.utxo.clone()],
            state: vec![next.hash()],
            outputs: vec![PlannedOutput::Contract(CovenantKind::Bridge, amount)],
        };

        let tx = self
            .assemble(plan, |fee_prevouts, change| {
                vec![
                    InputCall::Bridge(BridgeCall::FinalizeL1Deposit {
                        bridge: bridge.state.input(bridge_tx.clone()),
                        proof: proof.clone(),
                        aggregator_tx: trace.tx.clone(),
                        aggregator_state: root.state.clone(),
                        fee_prevouts: fee_prevouts.clone(),
                        change,
                    }),
                    InputCall::Aggregator(DepositAggregatorCall::FinalizeL1 {
                        prev_tx: trace.tx.clone(),
                        state: root.state.clone(),
                        bridge_prev_tx: bridge_tx.clone(),
                        fee_prevouts,
                    }),
                ]
            })
            .await?;
        let utxo = output_utxo(&tx, BRIDGE_VOUT)?;

        info!(txid = %tx.compute_txid(), batch_id = %id, %slot, %amount, "built L1 finalization");
        Ok(Built {
            tx,
            output: FinalizedDeposit {
                bridge: CovenantUtxo::new(next, utxo),
                batch_id: id,
                slot,
            },
        })
    }

    /// Clears the slot of `batch_id` once L2 has credited the batch.
    pub async fn finalize_l2_deposit(
        &self,
        bridge: &BridgeOutput,
        batch_id: &Buf32,
    ) -> ExecResult<Built<BridgeOutput>> {
        if *batch_id == EMPTY_BATCH_ID {
            return Err(ExecError::Validation("batch id is empty".to_string()));
        }
        let slot = bridge
            .state
            .batches
            .position_of(batch_id)
            .ok_or_else(|| ExecError::Validation(format!("batch {batch_id} not in bridge")))?;

        let bridge_tx = self
            .backtracer
            .backtrace_bridge(&bridge.utxo, &bridge.state)
            .await?;
        let proof = bridge.state.batches.proof(slot)?;
        let next = bridge.state.with_slot(slot, EMPTY_BATCH_ID)?;

        let amount = bridge.utxo.value.to_sat();
        let plan = TxPlan {
            covenant_inputs: vec![bridge.utxo.clone()],
            state: vec![next.hash()],
            outputs: vec![PlannedOutput::Contract(CovenantKind::Bridge, amount)],
        };

        let tx = self
            .assemble(plan, |fee_prevouts, change| {
                vec![InputCall::Bridge(BridgeCall::FinalizeL2Deposit {
                    bridge: bridge.state.input(bridge_tx.clone()),
                    proof: proof.clone(),
                    batch_id: *batch_id,
                    fee_prevouts,
                    change,
                })]
            })
            .await?;
        let utxo = output_utxo(&tx, BRIDGE_VOUT)?;

        info!(txid = %tx.compute_txid(), %batch_id, %slot, "built L2 finalization");
        Ok(Built {
            tx,
            output: CovenantUtxo::new(next, utxo),
        })
    }
}
