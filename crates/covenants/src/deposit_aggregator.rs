//! The DepositAggregator covenant.
//!
//! Deposits are created as level-0 aggregator outputs and merged pairwise until a single root is
//! left, which is then spent into the bridge. Every aggregator transaction puts the new node's
//! hash in slot `0` of its state output and the aggregated amount in output `1`.

use bitcoin::{Network, OutPoint, ScriptBuf};
use borsh::{BorshDeserialize, BorshSerialize};
use catbridge_merkle::aggregation::AggregationNode;
use catbridge_primitives::amount::BitcoinAmount;
use tracing::debug;

use crate::{
    bridge::{Bridge, BRIDGE_VOUT},
    covenant::{expect_script, Covenant, SpendContext},
    errors::{CovenantError, CovenantResult},
    scripts::CovenantScript,
    tx::{state_output, CovenantTx, CovenantTxOut, Prevout},
};

/// Tag distinguishing the deposit aggregator leaf script.
pub const DEPOSIT_AGGREGATOR_TAG: &[u8] = b"catbridge/deposit-aggregator";

/// Output index of the aggregator contract output in deposit and aggregate transactions.
pub const AGGREGATOR_VOUT: u32 = 1;

/// Methods of the deposit aggregator.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum DepositAggregatorCall {
    /// Merges two sibling nodes; both inputs 0 and 1 are unlocked with the same call.
    Aggregate {
        /// Transaction that created the first node.
        prev_tx0: CovenantTx,

        /// Transaction that created the second node.
        prev_tx1: CovenantTx,

        /// State of the first node.
        state0: AggregationNode,

        /// State of the second node.
        state1: AggregationNode,

        /// For non-leaf nodes, the four transactions that created the nodes merged into them.
        ancestors: Vec<CovenantTx>,

        /// Fee inputs after the covenant inputs.
        fee_prevouts: Vec<Prevout>,

        /// Change output, if any.
        change: Option<CovenantTxOut>,
    },

    /// Spends the aggregator root into the bridge as input 1.
    FinalizeL1 {
        /// Transaction that created the root.
        prev_tx: CovenantTx,

        /// State of the root.
        state: AggregationNode,

        /// Transaction that created the bridge output spent as input 0.
        bridge_prev_tx: CovenantTx,

        /// Fee inputs after the covenant inputs.
        fee_prevouts: Vec<Prevout>,
    },
}

/// The deposit aggregator covenant.
#[derive(Debug, Clone)]
pub struct DepositAggregator {
    script: CovenantScript,
    bridge_spk: ScriptBuf,
}

impl DepositAggregator {
    /// Derives the aggregator for `operator`, finalizing into `bridge`.
    pub fn new(
        operator: &bitcoin::secp256k1::XOnlyPublicKey,
        bridge: &Bridge,
        network: Network,
    ) -> CovenantResult<Self> {
        let bridge_spk = bridge.script_pubkey();
        let script =
            CovenantScript::new(DEPOSIT_AGGREGATOR_TAG, Some(&bridge_spk), operator, network)?;
        Ok(Self { script, bridge_spk })
    }

    /// Script of the bridge this aggregator finalizes into.
    pub fn bridge_spk(&self) -> &ScriptBuf {
        &self.bridge_spk
    }

    /// Authenticates a node against the transaction that created it and returns its amount.
    fn check_node(&self, prev_tx: &CovenantTx, state: &AggregationNode) -> CovenantResult<u64> {
        let out = prev_tx.output(AGGREGATOR_VOUT)?;
        expect_script(&out.script, &self.script_pubkey(), "aggregator input")?;

        if prev_tx.state_hash_for(AGGREGATOR_VOUT)? != state.hash()? {
            return Err(CovenantError::StateMismatch("aggregator node"));
        }

        if let AggregationNode::Leaf(deposit) = state {
            if deposit.amount != out.value {
                return Err(CovenantError::Conservation(format!(
                    "deposit claims {} but output holds {}",
                    deposit.amount, out.value
                )));
            }
        }

        Ok(out.value)
    }

    /// Checks that `prev_tx` merged the two nodes created by `ancestors` into `state`.
    fn check_ancestors(
        &self,
        prev_tx: &CovenantTx,
        state: &AggregationNode,
        ancestors: &[CovenantTx],
    ) -> CovenantResult<()> {
        let (hash0, hash1) = state
            .child_hashes()
            .ok_or(CovenantError::StateMismatch("expected internal node"))?;

        for (i, (ancestor, child_hash)) in ancestors.iter().zip([hash0, hash1]).enumerate() {
            if prev_tx.input_prevout(i) != Some(ancestor.outpoint(AGGREGATOR_VOUT)) {
                return Err(CovenantError::Validation(format!(
                    "input {i} does not spend its ancestor"
                )));
            }
            expect_script(
                &ancestor.output(AGGREGATOR_VOUT)?.script,
                &self.script_pubkey(),
                "ancestor output",
            )?;
            if ancestor.state_hash_for(AGGREGATOR_VOUT)? != child_hash {
                return Err(CovenantError::StateMismatch("ancestor node"));
            }
        }

        Ok(())
    }
}

impl Covenant for DepositAggregator {
    type Call = DepositAggregatorCall;

    const NAME: &'static str = "deposit-aggregator";

    fn script(&self) -> &CovenantScript {
        &self.script
    }

    fn check_call(&self, call: &Self::Call, ctx: &SpendContext<'_>) -> CovenantResult<()> {
        match call {
            DepositAggregatorCall::Aggregate {
                prev_tx0,
                prev_tx1,
                state0,
                state1,
                ancestors,
                fee_prevouts,
                change,
            } => {
                let index = ctx.preimage().input_index();
                if index > 1 {
                    return Err(CovenantError::InputIndex {
                        expected: 1,
                        got: index,
                    });
                }

                let merged = AggregationNode::merge(state0, state1)?;
                let amount0 = self.check_node(prev_tx0, state0)?;
                let amount1 = self.check_node(prev_tx1, state1)?;

                if state0.is_leaf() {
                    if !ancestors.is_empty() {
                        return Err(CovenantError::Validation(
                            "leaf nodes have no ancestors".to_string(),
                        ));
                    }
                } else {
                    if ancestors.len() != 4 {
                        return Err(CovenantError::Validation(format!(
                            "expected 4 ancestors, got {}",
                            ancestors.len()
                        )));
                    }
                    self.check_ancestors(prev_tx0, state0, &ancestors[..2])?;
                    self.check_ancestors(prev_tx1, state1, &ancestors[2..])?;
                }

                let prevouts: [OutPoint; 2] = [
                    prev_tx0.outpoint(AGGREGATOR_VOUT),
                    prev_tx1.outpoint(AGGREGATOR_VOUT),
                ];
                ctx.expect_prevouts(&prevouts, fee_prevouts)?;

                let total = BitcoinAmount::from_sat(amount0)
                    .checked_add_script(BitcoinAmount::from_sat(amount1))?;

                debug!(level = merged.level(), %total, input = index, "aggregate deposits");
                ctx.expect_outputs(
                    vec![
                        state_output(&[merged.hash()?])?,
                        self.contract_output(total.to_sat()),
                    ],
                    change.as_ref(),
                )
            }

            DepositAggregatorCall::FinalizeL1 {
                prev_tx,
                state,
                bridge_prev_tx,
                fee_prevouts,
            } => {
                ctx.expect_input_index(1)?;
                self.check_node(prev_tx, state)?;

                expect_script(
                    &bridge_prev_tx.output(BRIDGE_VOUT)?.script,
                    &self.bridge_spk,
                    "bridge input",
                )?;

                ctx.expect_prevouts(
                    &[
                        bridge_prev_tx.outpoint(BRIDGE_VOUT),
                        prev_tx.outpoint(AGGREGATOR_VOUT),
                    ],
                    fee_prevouts,
                )
            }
        }
    }
}
