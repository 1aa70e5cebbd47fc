//! The WithdrawalExpander covenant.
//!
//! A withdrawal batch leaves the bridge as a single expander output committing to the root of its
//! expansion tree. `expand` splits a node into its two children; once a node is shallow enough,
//! `distribute` pays its leaves out directly.

use bitcoin::{Amount, Network, TxOut};
use borsh::{BorshDeserialize, BorshSerialize};
use catbridge_merkle::expansion::{subtree_root, ExpansionNode, Withdrawal};
use catbridge_primitives::constants::MAX_DISTRIBUTE_LEVEL;
use tracing::debug;

use crate::{
    covenant::{expect_script, Covenant, SpendContext},
    errors::{CovenantError, CovenantResult},
    scripts::CovenantScript,
    tx::{state_output, CovenantTx, CovenantTxOut, Prevout},
};

/// Tag distinguishing the withdrawal expander leaf script.
pub const WITHDRAWAL_EXPANDER_TAG: &[u8] = b"catbridge/withdrawal-expander";

/// Methods of the withdrawal expander.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum WithdrawalExpanderCall {
    /// Splits an internal node into its children.
    Expand {
        /// Transaction that created the node.
        prev_tx: CovenantTx,

        /// Output of `prev_tx` holding the node.
        prev_vout: u32,

        /// The node being split.
        state: ExpansionNode,

        /// Fee inputs after the covenant input.
        fee_prevouts: Vec<Prevout>,

        /// Change output, if any.
        change: Option<CovenantTxOut>,
    },

    /// Pays out every leaf under a node of level at most [`MAX_DISTRIBUTE_LEVEL`].
    Distribute {
        /// Transaction that created the node.
        prev_tx: CovenantTx,

        /// Output of `prev_tx` holding the node.
        prev_vout: u32,

        /// The `2^level` leaves under the node, padding included.
        withdrawals: Vec<Withdrawal>,

        /// Fee inputs after the covenant input.
        fee_prevouts: Vec<Prevout>,

        /// Change output, if any.
        change: Option<CovenantTxOut>,
    },
}

/// The withdrawal expander covenant.
#[derive(Debug, Clone)]
pub struct WithdrawalExpander {
    script: CovenantScript,
}

impl WithdrawalExpander {
    /// Derives the expander for `operator`.
    pub fn new(
        operator: &bitcoin::secp256k1::XOnlyPublicKey,
        network: Network,
    ) -> CovenantResult<Self> {
        let script = CovenantScript::new(WITHDRAWAL_EXPANDER_TAG, None, operator, network)?;
        Ok(Self { script })
    }

    /// Authenticates the spent node and checks it holds exactly its committed amount.
    fn check_node(
        &self,
        prev_tx: &CovenantTx,
        prev_vout: u32,
        state: &ExpansionNode,
        ctx: &SpendContext<'_>,
        fee_prevouts: &[Prevout],
    ) -> CovenantResult<()> {
        ctx.expect_input_index(0)?;

        let out = prev_tx.output(prev_vout)?;
        expect_script(&out.script, &self.script_pubkey(), "expander input")?;

        if prev_tx.state_hash_for(prev_vout)? != state.hash()? {
            return Err(CovenantError::StateMismatch("expander node"));
        }
        let committed = state.amount()?;
        if out.value != committed {
            return Err(CovenantError::Conservation(format!(
                "node commits {committed} but output holds {}",
                out.value
            )));
        }

        ctx.expect_prevouts(&[prev_tx.outpoint(prev_vout)], fee_prevouts)
    }
}

impl Covenant for WithdrawalExpander {
    type Call = WithdrawalExpanderCall;

    const NAME: &'static str = "withdrawal-expander";

    fn script(&self) -> &CovenantScript {
        &self.script
    }

    fn check_call(&self, call: &Self::Call, ctx: &SpendContext<'_>) -> CovenantResult<()> {
        match call {
            WithdrawalExpanderCall::Expand {
                prev_tx,
                prev_vout,
                state,
                fee_prevouts,
                change,
            } => {
                self.check_node(prev_tx, *prev_vout, state, ctx, fee_prevouts)?;

                let ExpansionNode::Internal {
                    level,
                    left_amt,
                    left_hash,
                    right_amt,
                    right_hash,
                } = state
                else {
                    return Err(CovenantError::Validation(
                        "cannot expand a leaf".to_string(),
                    ));
                };
                if *left_amt == 0 {
                    return Err(CovenantError::Validation(
                        "left subtree holds nothing".to_string(),
                    ));
                }

                let mut outputs = vec![
                    state_output(&[*left_hash, *right_hash])?,
                    self.contract_output(*left_amt),
                ];
                if *right_amt > 0 {
                    outputs.push(self.contract_output(*right_amt));
                }

                debug!(%level, %left_amt, %right_amt, "expand withdrawals");
                ctx.expect_outputs(outputs, change.as_ref())
            }

            WithdrawalExpanderCall::Distribute {
                prev_tx,
                prev_vout,
                withdrawals,
                fee_prevouts,
                change,
            } => {
                let state = subtree_root(withdrawals)?;
                if state.level() > MAX_DISTRIBUTE_LEVEL {
                    return Err(CovenantError::Validation(format!(
                        "cannot distribute {} withdrawals at once",
                        withdrawals.len()
                    )));
                }
                self.check_node(prev_tx, *prev_vout, &state, ctx, fee_prevouts)?;

                let outputs: Vec<TxOut> = withdrawals
                    .iter()
                    .filter(|w| !w.is_placeholder())
                    .map(|w| TxOut {
                        value: Amount::from_sat(w.amount()),
                        script_pubkey: w.script_pubkey(),
                    })
                    .collect();

                debug!(level = state.level(), payouts = outputs.len(), "distribute withdrawals");
                ctx.expect_outputs(outputs, change.as_ref())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::{OutPoint, Transaction};
    use catbridge_merkle::expansion::ExpansionTree;
    use catbridge_primitives::hash::sha256;

    use super::*;
    use crate::{
        covenant::verify_spend,
        test_utils::{change_output, covenants, fee_input, operator, p2tr, prev_tx, spend},
        CovenantSet,
    };

    fn batch(amounts: &[u64]) -> ExpansionTree {
        let withdrawals: Vec<_> = amounts
            .iter()
            .enumerate()
            .map(|(i, amount)| Withdrawal::new(&p2tr(0x40 + i as u8), *amount).unwrap())
            .collect();
        ExpansionTree::build(&withdrawals).unwrap()
    }

    /// A createWithdrawal-shaped transaction: the expander root sits at output 2, state slot 1.
    fn withdrawal_tx(set: &CovenantSet, tree: &ExpansionTree) -> CovenantTx {
        prev_tx(
            0xe0,
            vec![
                state_output(&[sha256(b"bridge state"), tree.root().hash().unwrap()]).unwrap(),
                set.bridge.contract_output(1_000),
                set.withdrawal_expander.contract_output(tree.total().unwrap()),
            ],
        )
    }

    fn input(tx: &CovenantTx, vout: u32) -> (OutPoint, TxOut) {
        (tx.outpoint(vout), TxOut::from(&tx.outputs[vout as usize]))
    }

    fn expand(
        set: &CovenantSet,
        prev: &CovenantTx,
        prev_vout: u32,
        node: &ExpansionNode,
        outputs: Vec<TxOut>,
    ) -> (Transaction, Vec<TxOut>, WithdrawalExpanderCall) {
        let fee = fee_input(0xf4);
        let change = change_output();
        let mut all = outputs;
        all.push(TxOut::from(&change));
        let (tx, prevouts) = spend(
            &[input(prev, prev_vout), fee.clone()],
            all,
            &[(0, set.withdrawal_expander.script())],
        );
        let call = WithdrawalExpanderCall::Expand {
            prev_tx: prev.clone(),
            prev_vout,
            state: node.clone(),
            fee_prevouts: vec![fee.0.into()],
            change: Some(change),
        };
        (tx, prevouts, call)
    }

    fn split_outputs(set: &CovenantSet, tree: &ExpansionTree, level: u8, idx: usize) -> Vec<TxOut> {
        let (left, right) = tree.children(level, idx).unwrap();
        vec![
            state_output(&[left.hash().unwrap(), right.hash().unwrap()]).unwrap(),
            set.withdrawal_expander.contract_output(left.amount().unwrap()),
            set.withdrawal_expander.contract_output(right.amount().unwrap()),
        ]
    }

    #[test]
    fn test_expand_then_distribute() {
        let op = operator();
        let set = covenants(&op);
        let expander = &set.withdrawal_expander;
        let xonly = op.x_only_public_key().0;
        let amounts: Vec<u64> = (1..=8).map(|i| i * 1_000_000).collect();
        let tree = batch(&amounts);
        let root_tx = withdrawal_tx(&set, &tree);

        let (mut tx, prevouts, call) =
            expand(&set, &root_tx, 2, tree.root(), split_outputs(&set, &tree, 3, 0));
        let ctx = SpendContext::new(&tx, &prevouts, 0, expander.script()).unwrap();
        tx.input[0].witness = expander.unlock(&call, &ctx, &op).unwrap();
        verify_spend(&tx, &prevouts, 0, &xonly).unwrap();

        // both level-2 children can be paid out directly
        let expanded = CovenantTx::from_transaction(&tx);
        for (vout, idx) in [(1u32, 0usize), (2, 1)] {
            let withdrawals = tree.leaves_under(2, idx);
            let outputs: Vec<TxOut> = withdrawals
                .iter()
                .map(|w| TxOut {
                    value: Amount::from_sat(w.amount()),
                    script_pubkey: w.script_pubkey(),
                })
                .collect();
            let fee = fee_input(0xf5);
            let (mut tx, prevouts) = spend(
                &[input(&expanded, vout), fee.clone()],
                outputs,
                &[(0, expander.script())],
            );
            let call = WithdrawalExpanderCall::Distribute {
                prev_tx: expanded.clone(),
                prev_vout: vout,
                withdrawals,
                fee_prevouts: vec![fee.0.into()],
                change: None,
            };
            let ctx = SpendContext::new(&tx, &prevouts, 0, expander.script()).unwrap();
            tx.input[0].witness = expander.unlock(&call, &ctx, &op).unwrap();
            verify_spend(&tx, &prevouts, 0, &xonly).unwrap();
        }
    }

    #[test]
    fn test_expand_must_split_exactly() {
        let op = operator();
        let set = covenants(&op);
        let tree = batch(&[5_000, 6_000, 7_000, 8_000]);
        let root_tx = withdrawal_tx(&set, &tree);

        let mut outputs = split_outputs(&set, &tree, 2, 0);
        outputs[2] = set.withdrawal_expander.contract_output(14_999);
        let (tx, prevouts, call) = expand(&set, &root_tx, 2, tree.root(), outputs);
        let ctx = SpendContext::new(&tx, &prevouts, 0, set.withdrawal_expander.script()).unwrap();

        assert!(matches!(
            set.withdrawal_expander.check_call(&call, &ctx),
            Err(CovenantError::OutputsMismatch)
        ));
    }

    #[test]
    fn test_expand_rejects_wrong_node() {
        let op = operator();
        let set = covenants(&op);
        let tree = batch(&[5_000, 6_000, 7_000, 8_000]);
        let other = batch(&[5_000, 6_000, 7_000, 9_000]);
        let root_tx = withdrawal_tx(&set, &tree);

        let (tx, prevouts, call) =
            expand(&set, &root_tx, 2, other.root(), split_outputs(&set, &other, 2, 0));
        let ctx = SpendContext::new(&tx, &prevouts, 0, set.withdrawal_expander.script()).unwrap();

        assert!(matches!(
            set.withdrawal_expander.check_call(&call, &ctx),
            Err(CovenantError::StateMismatch(_))
        ));
    }

    #[test]
    fn test_distribute_skips_placeholders() {
        let op = operator();
        let set = covenants(&op);
        let expander = &set.withdrawal_expander;
        let tree = batch(&[1_000, 2_000, 3_000]);
        let root_tx = withdrawal_tx(&set, &tree);
        let withdrawals = tree.leaves_under(2, 0);
        assert_eq!(withdrawals.len(), 4);

        let payouts: Vec<TxOut> = withdrawals[..3]
            .iter()
            .map(|w| TxOut {
                value: Amount::from_sat(w.amount()),
                script_pubkey: w.script_pubkey(),
            })
            .collect();
        let fee = fee_input(0xf6);
        let (tx, prevouts) = spend(
            &[input(&root_tx, 2), fee.clone()],
            payouts,
            &[(0, expander.script())],
        );

        let call = WithdrawalExpanderCall::Distribute {
            prev_tx: root_tx.clone(),
            prev_vout: 2,
            withdrawals: withdrawals.clone(),
            fee_prevouts: vec![fee.0.into()],
            change: None,
        };
        let ctx = SpendContext::new(&tx, &prevouts, 0, expander.script()).unwrap();
        expander.check_call(&call, &ctx).unwrap();

        // dropping the padding changes the committed subtree
        let call = WithdrawalExpanderCall::Distribute {
            prev_tx: root_tx,
            prev_vout: 2,
            withdrawals: withdrawals[..2].to_vec(),
            fee_prevouts: vec![fee.0.into()],
            change: None,
        };
        assert!(expander.check_call(&call, &ctx).is_err());
    }

    #[test]
    fn test_distribute_too_deep_fails() {
        let op = operator();
        let set = covenants(&op);
        let tree = batch(&[1_000; 8]);
        let root_tx = withdrawal_tx(&set, &tree);
        let fee = fee_input(0xf7);
        let (tx, prevouts) = spend(
            &[input(&root_tx, 2), fee.clone()],
            vec![],
            &[(0, set.withdrawal_expander.script())],
        );

        let call = WithdrawalExpanderCall::Distribute {
            prev_tx: root_tx,
            prev_vout: 2,
            withdrawals: tree.leaves_under(3, 0),
            fee_prevouts: vec![fee.0.into()],
            change: None,
        };
        let ctx = SpendContext::new(&tx, &prevouts, 0, set.withdrawal_expander.script()).unwrap();

        assert!(matches!(
            set.withdrawal_expander.check_call(&call, &ctx),
            Err(CovenantError::Validation(_))
        ));
    }
}
