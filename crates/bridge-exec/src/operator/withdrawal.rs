//! The withdrawal path: move a batch out of the bridge, split it, pay it out.

use bitcoin::{Amount, TxOut};
use catbridge_btcio::{ChainProvider, Signer, UtxoProvider};
use catbridge_covenants::{
    bridge::{BridgeCall, BRIDGE_VOUT},
    state::{ExpansionNode, Withdrawal},
    withdrawal_expander::WithdrawalExpanderCall,
};
use catbridge_merkle::expansion::ExpansionTree;
use catbridge_primitives::{constants::MAX_DISTRIBUTE_LEVEL, utxo::CovenantUtxo};
use tracing::*;

use super::{
    assemble::{CovenantKind, InputCall, PlannedOutput, TxPlan},
    output_utxo, BridgeOperator, BridgeOutput, Built, CreatedWithdrawal, ExpanderEntry,
    ExpanderPosition,
};
use crate::errors::{ExecError, ExecResult};

/// Output of a withdrawal creation holding the expander root.
const EXPANDER_ROOT_VOUT: u32 = 2;

/// Outputs of an expansion holding the left and right children.
const LEFT_VOUT: u32 = 1;
const RIGHT_VOUT: u32 = 2;

impl<C, U, S> BridgeOperator<C, U, S>
where
    C: ChainProvider,
    U: UtxoProvider,
    S: Signer,
{
    /// Moves the total of `tree` out of the bridge into a withdrawal expander root.
    pub async fn create_withdrawal(
        &self,
        bridge: &BridgeOutput,
        tree: &ExpansionTree,
    ) -> ExecResult<Built<CreatedWithdrawal>> {
        let sum = tree.total()?;
        if sum == 0 {
            return Err(ExecError::Validation("empty withdrawal batch".to_string()));
        }
        let remaining = bridge
            .utxo
            .value
            .to_sat()
            .checked_sub(sum)
            .ok_or(ExecError::InsufficientFunds {
                needed: Amount::from_sat(sum),
                available: bridge.utxo.value,
            })?;

        let bridge_tx = self
            .backtracer
            .backtrace_bridge(&bridge.utxo, &bridge.state)
            .await?;

        let root = tree.root();
        let plan = TxPlan {
            covenant_inputs: vec![bridge.utxo.clone()],
            state: vec![bridge.state.hash(), root.hash()?],
            outputs: vec![
                PlannedOutput::Contract(CovenantKind::Bridge, remaining),
                PlannedOutput::Contract(CovenantKind::WithdrawalExpander, sum),
            ],
        };

        let tx = self
            .assemble(plan, |fee_prevouts, change| {
                vec![InputCall::Bridge(BridgeCall::CreateWithdrawal {
                    bridge: bridge.state.input(bridge_tx.clone()),
                    expander_root: root.clone(),
                    fee_prevouts,
                    change,
                })]
            })
            .await?;

        let position = ExpanderPosition {
            level: tree.height(),
            index: 0,
        };
        let output = CreatedWithdrawal {
            bridge: CovenantUtxo::new(bridge.state.clone(), output_utxo(&tx, BRIDGE_VOUT)?),
            expander: CovenantUtxo::new(position, output_utxo(&tx, EXPANDER_ROOT_VOUT)?),
        };

        info!(txid = %tx.compute_txid(), %sum, %remaining, height = tree.height(), "built withdrawal");
        Ok(Built { tx, output })
    }

    /// Splits the expander node at `entry` into its children.
    ///
    /// An empty right subtree gets no output.
    pub async fn expand(
        &self,
        tree: &ExpansionTree,
        entry: &ExpanderEntry,
    ) -> ExecResult<Built<Vec<ExpanderEntry>>> {
        let ExpanderPosition { level, index } = entry.state;
        let node = expander_node(tree, &entry.state)?;
        let (left, right) = tree
            .children(level, index)
            .ok_or_else(|| ExecError::Validation(format!("node {level}/{index} is a leaf")))?;
        let (left_amount, right_amount) = (left.amount()?, right.amount()?);
        if left_amount == 0 {
            return Err(ExecError::Validation(format!(
                "left subtree of {level}/{index} holds nothing"
            )));
        }

        let prev_tx = self
            .backtracer
            .backtrace_expander(&entry.utxo, node)
            .await?;

        let mut outputs = vec![PlannedOutput::Contract(
            CovenantKind::WithdrawalExpander,
            left_amount,
        )];
        if right_amount > 0 {
            outputs.push(PlannedOutput::Contract(
                CovenantKind::WithdrawalExpander,
                right_amount,
            ));
        }
        let plan = TxPlan {
            covenant_inputs: vec![entry.utxo.clone()],
            state: vec![left.hash()?, right.hash()?],
            outputs,
        };

        let tx = self
            .assemble(plan, |fee_prevouts, change| {
                vec![InputCall::Expander(WithdrawalExpanderCall::Expand {
                    prev_tx: prev_tx.clone(),
                    prev_vout: entry.utxo.vout,
                    state: node.clone(),
                    fee_prevouts,
                    change,
                })]
            })
            .await?;

        let mut children = vec![CovenantUtxo::new(
            ExpanderPosition {
                level: level - 1,
                index: 2 * index,
            },
            output_utxo(&tx, LEFT_VOUT)?,
        )];
        if right_amount > 0 {
            children.push(CovenantUtxo::new(
                ExpanderPosition {
                    level: level - 1,
                    index: 2 * index + 1,
                },
                output_utxo(&tx, RIGHT_VOUT)?,
            ));
        }

        info!(txid = %tx.compute_txid(), %level, %index, children = children.len(), "built expansion");
        Ok(Built {
            tx,
            output: children,
        })
    }

    /// Pays out every withdrawal under the expander node at `entry`.
    pub async fn distribute(
        &self,
        tree: &ExpansionTree,
        entry: &ExpanderEntry,
    ) -> ExecResult<Built<Vec<Withdrawal>>> {
        let ExpanderPosition { level, index } = entry.state;
        if level > MAX_DISTRIBUTE_LEVEL {
            return Err(ExecError::Validation(format!(
                "cannot distribute from level {level}, at most {MAX_DISTRIBUTE_LEVEL}"
            )));
        }
        let node = expander_node(tree, &entry.state)?;
        let withdrawals = tree.leaves_under(level, index);

        let prev_tx = self
            .backtracer
            .backtrace_expander(&entry.utxo, node)
            .await?;

        let payouts: Vec<Withdrawal> = withdrawals
            .iter()
            .filter(|w| !w.is_placeholder())
            .cloned()
            .collect();
        let plan = TxPlan {
            covenant_inputs: vec![entry.utxo.clone()],
            state: Vec::new(),
            outputs: payouts
                .iter()
                .map(|w| {
                    PlannedOutput::Payout(TxOut {
                        value: Amount::from_sat(w.amount()),
                        script_pubkey: w.script_pubkey(),
                    })
                })
                .collect(),
        };

        let tx = self
            .assemble(plan, |fee_prevouts, change| {
                vec![InputCall::Expander(WithdrawalExpanderCall::Distribute {
                    prev_tx: prev_tx.clone(),
                    prev_vout: entry.utxo.vout,
                    withdrawals: withdrawals.clone(),
                    fee_prevouts,
                    change,
                })]
            })
            .await?;

        info!(txid = %tx.compute_txid(), %level, %index, payouts = payouts.len(), "built distribution");
        Ok(Built {
            tx,
            output: payouts,
        })
    }
}

fn expander_node<'t>(
    tree: &'t ExpansionTree,
    position: &ExpanderPosition,
) -> ExecResult<&'t ExpansionNode> {
    tree.node(position.level, position.index).ok_or_else(|| {
        ExecError::Validation(format!(
            "no node at {}/{} in tree of height {}",
            position.level,
            position.index,
            tree.height()
        ))
    })
}

#[cfg(test)]
mod tests {
    use catbridge_test_utils::bitcoin::random_p2tr_script;

    use super::*;
    use crate::operator::test_utils::{operator, TestOperator};

    const BRIDGE_AMOUNT: u64 = 1_500_000;

    fn batch(amounts: &[u64]) -> ExpansionTree {
        let withdrawals: Vec<_> = amounts
            .iter()
            .map(|amount| Withdrawal::new(&random_p2tr_script(), *amount).unwrap())
            .collect();
        ExpansionTree::build(&withdrawals).unwrap()
    }

    async fn bridge(operator: &TestOperator) -> BridgeOutput {
        let built = operator.deploy_bridge(BRIDGE_AMOUNT).await.unwrap();
        operator.publish(&built.tx).await.unwrap();
        built.output
    }

    #[tokio::test]
    async fn test_withdrawal_lifecycle() {
        let (operator, chain) = operator(4);
        let bridge = bridge(&operator).await;
        let tree = batch(&[300_000, 200_000, 100_000]);

        let created = operator.create_withdrawal(&bridge, &tree).await.unwrap();
        operator.publish(&created.tx).await.unwrap();
        let CreatedWithdrawal { bridge, expander } = created.output;
        assert_eq!(bridge.utxo.value.to_sat(), BRIDGE_AMOUNT - 600_000);
        assert_eq!(expander.state, ExpanderPosition { level: 2, index: 0 });
        assert_eq!(expander.utxo.value.to_sat(), 600_000);

        let expanded = operator.expand(&tree, &expander).await.unwrap();
        operator.publish(&expanded.tx).await.unwrap();
        let children = expanded.output;
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].utxo.value.to_sat(), 500_000);
        assert_eq!(children[1].utxo.value.to_sat(), 100_000);

        let mut paid = Vec::new();
        for child in &children {
            let built = operator.distribute(&tree, child).await.unwrap();
            operator.publish(&built.tx).await.unwrap();
            paid.extend(built.output);
        }
        assert_eq!(paid.len(), 3);
        for withdrawal in &paid {
            assert_eq!(chain.unspent_for(&withdrawal.script_pubkey()).len(), 1);
        }
    }

    #[tokio::test]
    async fn test_expand_skips_empty_right_subtree() {
        let (operator, _chain) = operator(3);
        let bridge = bridge(&operator).await;
        let tree = ExpansionTree::build(&[
            Withdrawal::new(&random_p2tr_script(), 100_000).unwrap(),
            Withdrawal::placeholder(),
        ])
        .unwrap();

        let created = operator.create_withdrawal(&bridge, &tree).await.unwrap();
        operator.publish(&created.tx).await.unwrap();

        let expanded = operator
            .expand(&tree, &created.output.expander)
            .await
            .unwrap();
        assert_eq!(expanded.output.len(), 1);
        assert_eq!(expanded.tx.output[LEFT_VOUT as usize].value.to_sat(), 100_000);
    }

    #[tokio::test]
    async fn test_create_withdrawal_over_balance() {
        let (operator, _chain) = operator(3);
        let bridge = bridge(&operator).await;
        let tree = batch(&[1_000_000, 1_000_000]);

        assert!(matches!(
            operator.create_withdrawal(&bridge, &tree).await,
            Err(ExecError::InsufficientFunds { .. })
        ));
    }

    #[tokio::test]
    async fn test_distribute_rejects_high_level() {
        let (operator, _chain) = operator(3);
        let bridge = bridge(&operator).await;
        let tree = batch(&[10_000; 8]);

        let created = operator.create_withdrawal(&bridge, &tree).await.unwrap();
        operator.publish(&created.tx).await.unwrap();

        assert!(matches!(
            operator.distribute(&tree, &created.output.expander).await,
            Err(ExecError::Validation(_))
        ));
    }
}
