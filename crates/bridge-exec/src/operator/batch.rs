//! Build now, broadcast later.

use std::sync::Arc;

use bitcoin::{Transaction, Txid};
use catbridge_btcio::{BatchBroadcaster, ChainProvider, Signer, StagedUtxoView, UtxoProvider};
use tracing::*;

use super::BridgeOperator;
use crate::errors::ExecResult;

/// Transactions assembled against a staged view of the fee wallet and published together.
///
/// Each pushed transaction stages its spends and outputs, so later transactions in the batch
/// select around them. A transaction may spend covenant outputs of earlier ones only once those
/// are published: its backtrace reads the chain.
#[derive(Debug)]
pub struct TxBatch<C, U, S> {
    staged: Arc<StagedUtxoView<U>>,
    operator: BridgeOperator<C, StagedUtxoView<U>, S>,
    txs: Vec<Transaction>,
}

impl<C, U, S> TxBatch<C, U, S>
where
    C: ChainProvider,
    U: UtxoProvider,
    S: Signer,
{
    pub(super) fn new(parent: &BridgeOperator<C, U, S>) -> Self {
        let staged = Arc::new(StagedUtxoView::new(parent.utxos.clone()));
        let operator = parent.with_utxos(staged.clone());
        Self {
            staged,
            operator,
            txs: Vec::new(),
        }
    }

    /// The operator to build the batch's transactions with.
    pub fn operator(&self) -> &BridgeOperator<C, StagedUtxoView<U>, S> {
        &self.operator
    }

    /// Adds a built transaction to the batch.
    pub fn push(&mut self, tx: Transaction) -> Txid {
        let txid = tx.compute_txid();
        self.staged.stage_tx(&tx);
        self.txs.push(tx);
        txid
    }

    /// Number of transactions in the batch.
    pub fn len(&self) -> usize {
        self.txs.len()
    }

    /// Whether the batch holds no transactions.
    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    /// Broadcasts the batch in order.
    ///
    /// On failure the broadcast prefix stays committed, both on chain and in the fee wallet; the
    /// rest is abandoned and the error lists the prefix.
    pub async fn publish(self) -> ExecResult<Vec<Txid>> {
        let broadcaster = BatchBroadcaster::new(self.operator.chain.clone());

        match broadcaster.broadcast_all(&self.txs).await {
            Ok(txids) => {
                self.staged.commit_prefix(&txids).await?;
                info!(count = txids.len(), "published batch");
                Ok(txids)
            }
            Err(failure) => {
                if let Err(err) = self.staged.commit_prefix(&failure.broadcast).await {
                    warn!(%err, "could not commit broadcast prefix to fee wallet");
                }
                let abandoned = self.staged.rollback();
                error!(
                    broadcast = failure.broadcast.len(),
                    failed = %failure.failed,
                    abandoned = abandoned.len(),
                    reason = %failure.reason,
                    "batch broadcast stopped part way"
                );
                Err(failure.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::Amount;
    use catbridge_primitives::buf::Buf32;

    use crate::{errors::ExecError, operator::test_utils::operator};

    const DEPOSIT: u64 = 100_000;

    #[tokio::test]
    async fn test_batch_selects_around_staged_spends() {
        let (operator, chain) = operator(2);
        let mut batch = operator.batch();

        for seed in 0..3u8 {
            let built = batch
                .operator()
                .create_deposit(Buf32([seed; 32]), DEPOSIT)
                .await
                .unwrap();
            batch.push(built.tx);
        }
        assert_eq!(batch.len(), 3);

        let txids = batch.publish().await.unwrap();
        assert_eq!(txids.len(), 3);
        for txid in &txids {
            assert!(chain.contains(txid));
        }
    }

    #[tokio::test]
    async fn test_failed_broadcast_keeps_prefix() {
        let (operator, chain) = operator(3);
        let mut batch = operator.batch();

        let first = batch
            .operator()
            .create_deposit(Buf32([1; 32]), DEPOSIT)
            .await
            .unwrap();
        let mut second = batch
            .operator()
            .create_deposit(Buf32([2; 32]), DEPOSIT)
            .await
            .unwrap();
        // invalidates the fee input signature
        second.tx.output[1].value = Amount::from_sat(DEPOSIT - 1);
        let third = batch
            .operator()
            .create_deposit(Buf32([3; 32]), DEPOSIT)
            .await
            .unwrap();

        let first_txid = batch.push(first.tx);
        let second_txid = batch.push(second.tx);
        let third_txid = batch.push(third.tx);

        let Err(ExecError::BroadcastFailure(failure)) = batch.publish().await else {
            panic!("expected broadcast failure");
        };
        assert_eq!(failure.broadcast, vec![first_txid]);
        assert_eq!(failure.failed, second_txid);
        assert!(chain.contains(&first_txid));
        assert!(!chain.contains(&third_txid));
    }
}
