//! The event loop driving the operator.
//!
//! Events are folded into the [`OperatorState`] one at a time; after each, the driver executes
//! the actions the state derives until none is left. There is a single writer, the state is never
//! shared.

use std::{mem, sync::Arc};

use bitcoin::Txid;
use catbridge_btcio::{BroadcastFailure, ChainProvider, Signer, UtxoProvider};
use catbridge_common::retry::{
    policies::ExponentialBackoff, retry_with_backoff, DEFAULT_MAX_RETRIES,
};
use catbridge_covenants::{bridge::BRIDGE_VOUT, state::Withdrawal};
use catbridge_merkle::expansion::ExpansionTree;
use catbridge_primitives::utxo::CovenantUtxo;
use futures::future::try_join_all;
use tokio::sync::mpsc;
use tracing::*;

use crate::{
    errors::{ExecError, ExecResult},
    index::OffchainIndex,
    operator::{BridgeOperator, BridgeOutput, TxBatch},
    policy::{DepositPolicy, WithdrawalPolicy},
    state::{Action, Event, OperatorState, Outcome, WithdrawalBatch},
};

/// An outcome and, when only part of a batch made it on chain, why the rest did not.
#[derive(Debug)]
struct Executed {
    outcome: Outcome,
    failure: Option<BroadcastFailure>,
}

impl From<Outcome> for Executed {
    fn from(outcome: Outcome) -> Self {
        Self {
            outcome,
            failure: None,
        }
    }
}

/// Runs the operator over a stream of [`Event`]s.
#[derive(Debug)]
pub struct Driver<C, U, S, I> {
    operator: BridgeOperator<C, U, S>,
    index: Arc<I>,
    deposit_policy: DepositPolicy,
    withdrawal_policy: WithdrawalPolicy,
    confirmations: u64,
    state: OperatorState,
}

impl<C, U, S, I> Driver<C, U, S, I>
where
    C: ChainProvider,
    U: UtxoProvider,
    S: Signer,
    I: OffchainIndex,
{
    /// Creates a driver with no bridge; call [`Self::deploy`] or [`Self::restore_bridge`] next.
    pub fn new(
        operator: BridgeOperator<C, U, S>,
        index: Arc<I>,
        deposit_policy: DepositPolicy,
        withdrawal_policy: WithdrawalPolicy,
        confirmations: u64,
    ) -> Self {
        Self {
            operator,
            index,
            deposit_policy,
            withdrawal_policy,
            confirmations,
            state: OperatorState::default(),
        }
    }

    /// The current state.
    pub fn state(&self) -> &OperatorState {
        &self.state
    }

    /// The operator executing actions.
    pub fn operator(&self) -> &BridgeOperator<C, U, S> {
        &self.operator
    }

    /// Deploys a fresh bridge holding `amount` and tracks it.
    pub async fn deploy(&mut self, amount: u64) -> ExecResult<Txid> {
        let built = self.operator.deploy_bridge(amount).await?;
        let txid = self.operator.publish(&built.tx).await?;
        self.record_bridge(&built.output);
        self.state = OperatorState::new(built.output);

        info!(%txid, %amount, "deployed bridge");
        Ok(txid)
    }

    /// Resumes from the latest bridge output in the index, after backtracing it.
    ///
    /// Returns `false` if the index knows no bridge.
    pub async fn restore_bridge(&mut self) -> ExecResult<bool> {
        let Some(txid) = self.index.get_latest_bridge_txid() else {
            return Ok(false);
        };
        let state = self.index.get_bridge_state(&txid).ok_or_else(|| {
            ExecError::Validation(format!("index has no bridge state for {txid}"))
        })?;

        let raw = self.operator.chain().get_raw_transaction(&txid).await?;
        let utxo = crate::operator::output_utxo(&raw, BRIDGE_VOUT)?;
        self.operator
            .backtracer()
            .backtrace_bridge(&utxo, &state)
            .await?;

        info!(%txid, root = %state.batches_root(), "restored bridge");
        self.state = OperatorState::new(CovenantUtxo::new(state, utxo));
        Ok(true)
    }

    /// Consumes events until the channel closes and returns the final state.
    ///
    /// A failed step is logged; the next event derives the next step from the chain again.
    pub async fn run(mut self, mut events: mpsc::Receiver<Event>) -> OperatorState {
        info!("driver started");
        while let Some(event) = events.recv().await {
            if let Err(err) = self.process(event).await {
                error!(%err, "failed to process event");
            }
        }
        info!("event stream closed");
        self.state
    }

    /// Folds `event` in and executes every action that follows.
    ///
    /// An action that fails before broadcasting is deferred and the others still run.
    pub async fn process(&mut self, event: Event) -> ExecResult<()> {
        trace!(?event, "processing event");
        if let Event::DepositObserved { deposit, .. } = &event {
            self.index
                .set_deposit_info(deposit.utxo.txid, deposit.state.clone());
        }
        self.state = mem::take(&mut self.state).apply(&event);

        loop {
            self.refresh_confirmations().await?;
            let Some(action) = self
                .state
                .next_action(&self.deposit_policy, &self.withdrawal_policy)
            else {
                break;
            };

            let Executed { outcome, failure } = match self.execute(action.clone()).await {
                Ok(executed) => executed,
                Err(err) => Outcome::Failed {
                    action,
                    reason: err.to_string(),
                }
                .into(),
            };
            self.record(&outcome);
            self.state = mem::take(&mut self.state).apply_outcome(outcome);

            if let Some(failure) = failure {
                return Err(failure.into());
            }
        }

        Ok(())
    }

    async fn refresh_confirmations(&mut self) -> ExecResult<()> {
        if self.state.unconfirmed.is_empty() {
            return Ok(());
        }

        let chain = self.operator.chain();
        let backoff = ExponentialBackoff::default();
        let txids: Vec<Txid> = self.state.unconfirmed.iter().copied().collect();
        let confirmations = try_join_all(txids.iter().map(|txid| {
            retry_with_backoff("get_confirmations", DEFAULT_MAX_RETRIES, &backoff, move || {
                chain.get_confirmations(txid)
            })
        }))
        .await?;

        for (txid, confs) in txids.into_iter().zip(confirmations) {
            if confs >= self.confirmations {
                debug!(%txid, %confs, "transaction confirmed");
                self.state = mem::take(&mut self.state).apply(&Event::TxConfirmed { txid });
            }
        }
        Ok(())
    }

    fn bridge(&self) -> ExecResult<&BridgeOutput> {
        self.state
            .bridge
            .as_ref()
            .ok_or_else(|| ExecError::Validation("no bridge deployed".to_string()))
    }

    fn withdrawal_tree(&self, batch: usize) -> ExecResult<ExpansionTree> {
        let withdrawals: &[Withdrawal] = match self.state.withdrawal_batches.get(batch) {
            Some(WithdrawalBatch::Pending { withdrawals })
            | Some(WithdrawalBatch::Expanding { withdrawals, .. }) => withdrawals,
            _ => {
                return Err(ExecError::Validation(format!(
                    "withdrawal batch {batch} has nothing to pay"
                )))
            }
        };
        Ok(ExpansionTree::build(withdrawals)?)
    }

    async fn execute(&self, action: Action) -> ExecResult<Executed> {
        match action {
            Action::OpenDepositBatch { deposits } => {
                info!(count = deposits.len(), "opening deposit batch");
                Ok(Outcome::DepositBatchOpened { deposits }.into())
            }

            Action::Aggregate { batch, pairs } => {
                let mut tx_batch = self.operator.batch();
                let mut merged = Vec::with_capacity(pairs.len());
                for (left, right) in &pairs {
                    let built = tx_batch.operator().aggregate(left, right).await?;
                    let txid = tx_batch.push(built.tx);
                    merged.push((txid, (left.utxo.outpoint(), right.utxo.outpoint(), built.output)));
                }

                let (published, failure) = publish_batch(tx_batch).await?;
                let merged = published_only(merged, &published);
                info!(%batch, merged = merged.len(), "aggregated deposits");
                Ok(Executed {
                    outcome: Outcome::Aggregated {
                        batch,
                        merged,
                        txids: published,
                    },
                    failure,
                })
            }

            Action::FinalizeL1 { batch, root } => {
                let built = self
                    .operator
                    .finalize_l1_deposit(self.bridge()?, &root)
                    .await?;
                let txid = self.operator.publish(&built.tx).await?;
                let deposit = built.output;
                Ok(Outcome::FinalizedL1 {
                    batch,
                    bridge: deposit.bridge,
                    batch_id: deposit.batch_id,
                    slot: deposit.slot,
                    amount: root.utxo.value.to_sat(),
                    txid,
                }
                .into())
            }

            Action::FinalizeL2 { batch, batch_id } => {
                let built = self
                    .operator
                    .finalize_l2_deposit(self.bridge()?, &batch_id)
                    .await?;
                let txid = self.operator.publish(&built.tx).await?;
                Ok(Outcome::FinalizedL2 {
                    batch,
                    bridge: built.output,
                    txid,
                }
                .into())
            }

            Action::CreateWithdrawal { batch } => {
                let tree = self.withdrawal_tree(batch)?;
                let built = self
                    .operator
                    .create_withdrawal(self.bridge()?, &tree)
                    .await?;
                let txid = self.operator.publish(&built.tx).await?;
                Ok(Outcome::WithdrawalCreated {
                    batch,
                    bridge: built.output.bridge,
                    expander: built.output.expander,
                    txid,
                }
                .into())
            }

            Action::Expand { batch, nodes } => {
                let tree = self.withdrawal_tree(batch)?;
                let mut tx_batch = self.operator.batch();
                let mut expanded = Vec::with_capacity(nodes.len());
                for node in &nodes {
                    let built = tx_batch.operator().expand(&tree, node).await?;
                    let txid = tx_batch.push(built.tx);
                    expanded.push((txid, (node.utxo.outpoint(), built.output)));
                }

                let (published, failure) = publish_batch(tx_batch).await?;
                let expanded = published_only(expanded, &published);
                info!(%batch, expanded = expanded.len(), "expanded withdrawals");
                Ok(Executed {
                    outcome: Outcome::Expanded {
                        batch,
                        expanded,
                        txids: published,
                    },
                    failure,
                })
            }

            Action::Distribute { batch, nodes } => {
                let tree = self.withdrawal_tree(batch)?;
                let mut tx_batch = self.operator.batch();
                let mut spent = Vec::with_capacity(nodes.len());
                for node in &nodes {
                    let built = tx_batch.operator().distribute(&tree, node).await?;
                    let txid = tx_batch.push(built.tx);
                    spent.push((txid, node.utxo.outpoint()));
                }

                let (published, failure) = publish_batch(tx_batch).await?;
                let spent = published_only(spent, &published);
                info!(%batch, distributed = spent.len(), "distributed withdrawals");
                Ok(Executed {
                    outcome: Outcome::Distributed {
                        batch,
                        spent,
                        txids: published,
                    },
                    failure,
                })
            }
        }
    }

    /// Caches the states an outcome committed to.
    fn record(&self, outcome: &Outcome) {
        match outcome {
            Outcome::Aggregated { merged, .. } => {
                for (_, _, parent) in merged {
                    self.index
                        .set_deposit_info(parent.utxo.txid, parent.state.clone());
                }
            }
            Outcome::FinalizedL1 { bridge, .. }
            | Outcome::FinalizedL2 { bridge, .. }
            | Outcome::WithdrawalCreated { bridge, .. } => self.record_bridge(bridge),
            Outcome::DepositBatchOpened { .. }
            | Outcome::Expanded { .. }
            | Outcome::Distributed { .. }
            | Outcome::Failed { .. } => {}
        }
    }

    fn record_bridge(&self, bridge: &BridgeOutput) {
        self.index
            .set_bridge_state(bridge.utxo.txid, bridge.state.clone());
        self.index.set_latest_bridge_txid(bridge.utxo.txid);
    }
}

/// Publishes `batch`, turning a partial failure into the published prefix and the failure.
async fn publish_batch<C, U, S>(
    batch: TxBatch<C, U, S>,
) -> ExecResult<(Vec<Txid>, Option<BroadcastFailure>)>
where
    C: ChainProvider,
    U: UtxoProvider,
    S: Signer,
{
    match batch.publish().await {
        Ok(txids) => Ok((txids, None)),
        Err(ExecError::BroadcastFailure(failure)) => Ok((failure.broadcast.clone(), Some(failure))),
        Err(err) => Err(err),
    }
}

/// The items whose transaction made it on chain.
fn published_only<T>(items: Vec<(Txid, T)>, published: &[Txid]) -> Vec<T> {
    items
        .into_iter()
        .filter(|(txid, _)| published.contains(txid))
        .map(|(_, item)| item)
        .collect()
}

#[cfg(test)]
mod tests {
    use catbridge_primitives::buf::Buf32;
    use catbridge_test_utils::{bitcoin::random_p2tr_script, chain::MockChain};

    use super::*;
    use crate::{
        index::InMemoryIndex,
        operator::test_utils::{operator, TestOperator},
        state::DepositBatch,
    };

    const DEPOSIT: u64 = 100_000;

    type TestDriver = Driver<MockChain, MockChain, catbridge_btcio::LocalSigner, InMemoryIndex>;

    fn driver(operator: TestOperator, batch_size: usize) -> TestDriver {
        Driver::new(
            operator,
            Arc::new(InMemoryIndex::new()),
            DepositPolicy {
                batch_size,
                max_age_secs: 3_600,
            },
            WithdrawalPolicy::default(),
            1,
        )
    }

    async fn observe_deposit(driver: &mut TestDriver, seed: u8) {
        let built = driver
            .operator()
            .create_deposit(Buf32([seed; 32]), DEPOSIT)
            .await
            .unwrap();
        driver.operator().publish(&built.tx).await.unwrap();
        driver
            .process(Event::DepositObserved {
                deposit: built.output,
                time: 0,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_deposits_reach_bridge() {
        let (operator, chain) = operator(8);
        let mut driver = driver(operator, 4);
        driver.deploy(10_000).await.unwrap();

        for seed in 0..4 {
            observe_deposit(&mut driver, seed).await;
        }

        let state = driver.state();
        assert!(state.pending_deposits.is_empty());
        let DepositBatch::FinalizedL1 {
            batch_id, amount, ..
        } = state.deposit_batches[0].clone()
        else {
            panic!("batch not finalized: {:?}", state.deposit_batches[0]);
        };
        assert_eq!(amount, 4 * DEPOSIT);

        let bridge = state.bridge.clone().unwrap();
        assert_eq!(bridge.utxo.value.to_sat(), 10_000 + 4 * DEPOSIT);
        assert!(chain.is_unspent(&bridge.utxo.outpoint()));

        driver
            .process(Event::DepositsVerifiedOnL2 { batch_id })
            .await
            .unwrap();
        assert_eq!(
            driver.state().deposit_batches[0],
            DepositBatch::Completed { batch_id }
        );
    }

    #[tokio::test]
    async fn test_withdrawals_paid_out() {
        let (operator, chain) = operator(8);
        let mut driver = driver(operator, 4);
        driver.deploy(2_000_000).await.unwrap();

        let withdrawals: Vec<_> = [400_000, 300_000, 200_000, 100_000, 50_000]
            .iter()
            .map(|amount| Withdrawal::new(&random_p2tr_script(), *amount).unwrap())
            .collect();
        driver
            .process(Event::WithdrawalBatchClosed {
                withdrawals: withdrawals.clone(),
            })
            .await
            .unwrap();

        assert_eq!(
            driver.state().withdrawal_batches[0],
            WithdrawalBatch::Distributed {
                count: 5,
                total: 1_050_000
            }
        );
        for withdrawal in &withdrawals {
            assert_eq!(chain.unspent_for(&withdrawal.script_pubkey()).len(), 1);
        }
        let bridge = driver.state().bridge.clone().unwrap();
        assert_eq!(bridge.utxo.value.to_sat(), 950_000);
    }

    #[tokio::test]
    async fn test_unfundable_withdrawal_does_not_block_deposits() {
        let (operator, chain) = operator(8);
        let mut driver = driver(operator, 2);
        driver.deploy(10_000).await.unwrap();

        let withdrawals = vec![Withdrawal::new(&random_p2tr_script(), 1_000_000).unwrap()];
        driver
            .process(Event::WithdrawalBatchClosed { withdrawals })
            .await
            .unwrap();
        assert!(matches!(
            driver.state().withdrawal_batches[0],
            WithdrawalBatch::Pending { .. }
        ));
        assert_eq!(
            driver.state().deferred,
            vec![Action::CreateWithdrawal { batch: 0 }]
        );

        observe_deposit(&mut driver, 1).await;
        observe_deposit(&mut driver, 2).await;

        let state = driver.state();
        assert!(matches!(
            state.deposit_batches[0],
            DepositBatch::FinalizedL1 { amount, .. } if amount == 2 * DEPOSIT
        ));
        let bridge = state.bridge.clone().unwrap();
        assert_eq!(bridge.utxo.value.to_sat(), 10_000 + 2 * DEPOSIT);
        assert!(chain.is_unspent(&bridge.utxo.outpoint()));

        // retried once the bridge moved, still short
        assert!(matches!(
            state.withdrawal_batches[0],
            WithdrawalBatch::Pending { .. }
        ));
    }

    #[tokio::test]
    async fn test_restore_bridge_from_index() {
        let (operator, _chain) = operator(2);
        let index = Arc::new(InMemoryIndex::new());
        let mut first = Driver::new(
            operator,
            index.clone(),
            DepositPolicy::default(),
            WithdrawalPolicy::default(),
            1,
        );
        first.deploy(10_000).await.unwrap();
        let deployed = first.state().bridge.clone();

        let mut second = Driver::new(
            first.operator().with_utxos(first.operator().chain().clone()),
            index,
            DepositPolicy::default(),
            WithdrawalPolicy::default(),
            1,
        );
        assert!(second.restore_bridge().await.unwrap());
        assert_eq!(second.state().bridge, deployed);
    }
}
