//! The operator's workflows over the covenants.
//!
//! Every workflow authenticates the covenant outputs it spends with a backtrace, assembles and
//! signs the spend, and returns it unpublished as a [`Built`] value. Publishing is a separate
//! step, either one transaction at a time through [`BridgeOperator::publish`] or several at once
//! through a [`TxBatch`].

mod assemble;
mod batch;
mod deposit;
mod withdrawal;

use std::sync::Arc;

use bitcoin::{secp256k1::Keypair, FeeRate, Transaction, Txid};
use catbridge_backtrace::Backtracer;
use catbridge_btcio::{ChainProvider, Signer, UtxoProvider};
use catbridge_covenants::{
    state::{AggregationNode, BridgeState},
    CovenantSet,
};
use catbridge_primitives::{
    buf::Buf32,
    utxo::{CovenantUtxo, Utxo},
};
use serde::{Deserialize, Serialize};
use tracing::*;

pub use self::batch::TxBatch;
use crate::errors::{ExecError, ExecResult};

/// A deposit aggregator output and the node it commits to.
pub type DepositEntry = CovenantUtxo<AggregationNode>;

/// The bridge output and the state it commits to.
pub type BridgeOutput = CovenantUtxo<BridgeState>;

/// A withdrawal expander output and where its node sits in the batch's expansion tree.
pub type ExpanderEntry = CovenantUtxo<ExpanderPosition>;

/// Position of a node in an expansion tree; leaves are level `0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExpanderPosition {
    /// Level of the node.
    pub level: u8,

    /// Index of the node within its level, from the left.
    pub index: usize,
}

/// A signed transaction and the covenant outputs it creates.
#[derive(Debug, Clone)]
pub struct Built<T> {
    /// The signed transaction.
    pub tx: Transaction,

    /// What the transaction creates.
    pub output: T,
}

impl<T> Built<T> {
    /// The id of the transaction.
    pub fn txid(&self) -> Txid {
        self.tx.compute_txid()
    }
}

/// The bridge after a batch was merged into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedDeposit {
    /// The new bridge output.
    pub bridge: BridgeOutput,

    /// The id the batch occupies its slot with.
    pub batch_id: Buf32,

    /// The slot the batch was inserted at.
    pub slot: usize,
}

/// The outputs of a withdrawal leaving the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedWithdrawal {
    /// The new bridge output.
    pub bridge: BridgeOutput,

    /// The root of the withdrawal expansion tree.
    pub expander: ExpanderEntry,
}

/// Builds and publishes covenant transactions for one operator.
///
/// Covenant inputs are unlocked with the `operator` key; fees are paid from the fee wallet
/// behind `signer`, whose outputs are tracked by `utxos`.
#[derive(Debug)]
pub struct BridgeOperator<C, U, S> {
    chain: Arc<C>,
    utxos: Arc<U>,
    signer: Arc<S>,
    covenants: CovenantSet,
    operator: Keypair,
    fee_rate: FeeRate,
    backtracer: Backtracer<C>,
}

impl<C, U, S> BridgeOperator<C, U, S>
where
    C: ChainProvider,
    U: UtxoProvider,
    S: Signer,
{
    /// Creates the operator over its collaborators.
    pub fn new(
        chain: Arc<C>,
        utxos: Arc<U>,
        signer: Arc<S>,
        covenants: CovenantSet,
        operator: Keypair,
        fee_rate: FeeRate,
    ) -> Self {
        let backtracer = Backtracer::new(chain.clone(), covenants.clone());
        Self {
            chain,
            utxos,
            signer,
            covenants,
            operator,
            fee_rate,
            backtracer,
        }
    }

    /// The covenants this operator drives.
    pub fn covenants(&self) -> &CovenantSet {
        &self.covenants
    }

    /// The chain transactions are published to.
    pub fn chain(&self) -> &Arc<C> {
        &self.chain
    }

    /// The verifier used before every spend.
    pub fn backtracer(&self) -> &Backtracer<C> {
        &self.backtracer
    }

    /// The same operator over another view of the fee wallet.
    pub fn with_utxos<V: UtxoProvider>(&self, utxos: Arc<V>) -> BridgeOperator<C, V, S> {
        BridgeOperator::new(
            self.chain.clone(),
            utxos,
            self.signer.clone(),
            self.covenants.clone(),
            self.operator,
            self.fee_rate,
        )
    }

    /// Broadcasts `tx` and updates the fee wallet.
    ///
    /// Bookkeeping failures after the broadcast are logged: the transaction is out and the next
    /// selection from the wallet catches up with the chain.
    pub async fn publish(&self, tx: &Transaction) -> ExecResult<Txid> {
        let txid = self.chain.broadcast(tx).await?;
        info!(%txid, inputs = tx.input.len(), outputs = tx.output.len(), "published transaction");

        for txin in &tx.input {
            if let Err(err) = self.utxos.mark_spent(&txin.previous_output, &txid).await {
                warn!(%txid, outpoint = %txin.previous_output, %err, "could not mark output spent");
            }
        }

        let wallet_spk = self.signer.address().script_pubkey();
        for (vout, txout) in tx.output.iter().enumerate() {
            if txout.script_pubkey != wallet_spk {
                continue;
            }
            let Some(utxo) = Utxo::from_tx_output(tx, vout as u32) else {
                continue;
            };
            if let Err(err) = self.utxos.add_utxo(utxo).await {
                warn!(%txid, %vout, %err, "could not record change output");
            }
        }

        Ok(txid)
    }

    /// Starts a batch of transactions assembled against a staged view of the fee wallet.
    pub fn batch(&self) -> TxBatch<C, U, S> {
        TxBatch::new(self)
    }
}

/// The output `vout` of a transaction just built.
pub(crate) fn output_utxo(tx: &Transaction, vout: u32) -> ExecResult<Utxo> {
    Utxo::from_tx_output(tx, vout)
        .ok_or_else(|| ExecError::Validation(format!("built transaction has no output {vout}")))
}
