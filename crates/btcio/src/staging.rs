//! Two-phase UTXO bookkeeping for transactions built ahead of their broadcast.

use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use bitcoin::{Address, OutPoint, Transaction, Txid};
use catbridge_primitives::utxo::Utxo;
use parking_lot::Mutex;
use tracing::*;

use crate::{
    rpc::error::ClientResult,
    traits::{UtxoProvider, UtxoQuery},
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum StagedEntry {
    Spend { outpoint: OutPoint, spent_by: Txid },
    Output(Utxo),
}

impl StagedEntry {
    fn txid(&self) -> Txid {
        match self {
            Self::Spend { spent_by, .. } => *spent_by,
            Self::Output(utxo) => utxo.txid,
        }
    }
}

/// A view over a [`UtxoProvider`] that holds spends and outputs of unbroadcast transactions.
///
/// Selections through the view see staged changes. Nothing reaches the underlying provider until
/// [`commit_prefix`](Self::commit_prefix) is called with the transactions that made it on chain.
#[derive(Debug)]
pub struct StagedUtxoView<P> {
    inner: Arc<P>,
    staged: Mutex<Vec<StagedEntry>>,
}

impl<P: UtxoProvider> StagedUtxoView<P> {
    pub fn new(inner: Arc<P>) -> Self {
        Self {
            inner,
            staged: Mutex::new(Vec::new()),
        }
    }

    pub fn inner(&self) -> &Arc<P> {
        &self.inner
    }

    pub fn stage_spend(&self, outpoint: OutPoint, spent_by: Txid) {
        self.staged
            .lock()
            .push(StagedEntry::Spend { outpoint, spent_by });
    }

    pub fn stage_output(&self, utxo: Utxo) {
        self.staged.lock().push(StagedEntry::Output(utxo));
    }

    /// Stages every input of `tx` as spent and every non-`OP_RETURN` output as created.
    pub fn stage_tx(&self, tx: &Transaction) {
        let txid = tx.compute_txid();
        let mut staged = self.staged.lock();
        for txin in &tx.input {
            staged.push(StagedEntry::Spend {
                outpoint: txin.previous_output,
                spent_by: txid,
            });
        }
        for vout in 0..tx.output.len() as u32 {
            if let Some(utxo) = Utxo::from_tx_output(tx, vout) {
                if !utxo.script_pubkey.is_op_return() {
                    staged.push(StagedEntry::Output(utxo));
                }
            }
        }
        trace!(%txid, "staged transaction");
    }

    /// Number of staged entries not yet committed or rolled back.
    pub fn pending(&self) -> usize {
        self.staged.lock().len()
    }

    /// Forwards the staged entries of `txids` to the underlying provider.
    ///
    /// Entries of other transactions stay staged.
    pub async fn commit_prefix(&self, txids: &[Txid]) -> ClientResult<()> {
        let committed: HashSet<Txid> = txids.iter().copied().collect();
        let to_commit = {
            let mut staged = self.staged.lock();
            let (commit, keep): (Vec<_>, Vec<_>) = staged
                .drain(..)
                .partition(|entry| committed.contains(&entry.txid()));
            *staged = keep;
            commit
        };

        for entry in to_commit {
            match entry {
                StagedEntry::Spend { outpoint, spent_by } => {
                    self.inner.mark_spent(&outpoint, &spent_by).await?
                }
                StagedEntry::Output(utxo) => self.inner.add_utxo(utxo).await?,
            }
        }

        debug!(count = txids.len(), "committed staged transactions");
        Ok(())
    }

    /// Drops everything still staged and returns the abandoned transactions in staging order.
    pub fn rollback(&self) -> Vec<Txid> {
        let mut abandoned = Vec::new();
        for entry in self.staged.lock().drain(..) {
            let txid = entry.txid();
            if !abandoned.contains(&txid) {
                abandoned.push(txid);
            }
        }

        if !abandoned.is_empty() {
            warn!(?abandoned, "rolled back staged transactions");
        }
        abandoned
    }

    fn staged_spends(&self) -> HashSet<OutPoint> {
        self.staged
            .lock()
            .iter()
            .filter_map(|entry| match entry {
                StagedEntry::Spend { outpoint, .. } => Some(*outpoint),
                StagedEntry::Output(_) => None,
            })
            .collect()
    }

    fn staged_outputs(&self, address: &Address) -> Vec<Utxo> {
        let script = address.script_pubkey();
        self.staged
            .lock()
            .iter()
            .filter_map(|entry| match entry {
                StagedEntry::Output(utxo) if utxo.script_pubkey == script => Some(utxo.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl<P: UtxoProvider> UtxoProvider for StagedUtxoView<P> {
    async fn get_utxos(&self, address: &Address, query: UtxoQuery) -> ClientResult<Vec<Utxo>> {
        let confirmed = self
            .inner
            .get_utxos(address, UtxoQuery::default())
            .await?;

        let spent = self.staged_spends();
        let utxos = confirmed
            .into_iter()
            .chain(self.staged_outputs(address))
            .filter(|utxo| !spent.contains(&utxo.outpoint()));

        Ok(query.select(utxos))
    }

    async fn mark_spent(&self, outpoint: &OutPoint, spent_by: &Txid) -> ClientResult<()> {
        self.stage_spend(*outpoint, *spent_by);
        Ok(())
    }

    async fn add_utxo(&self, utxo: Utxo) -> ClientResult<()> {
        self.stage_output(utxo);
        Ok(())
    }
}
