//! The chain-facing collaborators of the bridge operator.

use async_trait::async_trait;
use bitcoin::{secp256k1::XOnlyPublicKey, Address, Amount, OutPoint, Transaction, TxOut, Txid};
use catbridge_primitives::utxo::Utxo;

use crate::rpc::error::ClientResult;

/// Access to transactions on chain.
#[cfg_attr(any(test, feature = "test_utils"), mockall::automock)]
#[async_trait]
pub trait ChainProvider: Sync + Send + 'static {
    /// Publishes `tx` and returns its id.
    async fn broadcast(&self, tx: &Transaction) -> ClientResult<Txid>;

    /// Fetches a transaction by id.
    async fn get_raw_transaction(&self, txid: &Txid) -> ClientResult<Transaction>;

    /// Number of confirmations of a transaction, `0` while unconfirmed.
    async fn get_confirmations(&self, txid: &Txid) -> ClientResult<u64>;
}

/// Limits on the outputs returned by [`UtxoProvider::get_utxos`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UtxoQuery {
    /// Stop once the selected outputs hold at least this much.
    pub total: Option<Amount>,

    /// Return at most this many outputs.
    pub max_count: Option<usize>,
}

impl UtxoQuery {
    /// Selects outputs in order until the limits are reached.
    pub fn select(&self, utxos: impl IntoIterator<Item = Utxo>) -> Vec<Utxo> {
        let mut selected = Vec::new();
        let mut sum = Amount::ZERO;

        for utxo in utxos {
            if self.max_count.is_some_and(|max| selected.len() >= max) {
                break;
            }
            if self.total.is_some_and(|total| sum >= total) {
                break;
            }
            sum += utxo.value;
            selected.push(utxo);
        }

        selected
    }
}

/// Tracks the spendable outputs of an address.
#[cfg_attr(any(test, feature = "test_utils"), mockall::automock)]
#[async_trait]
pub trait UtxoProvider: Sync + Send + 'static {
    /// Unspent outputs paying to `address`.
    async fn get_utxos(&self, address: &Address, query: UtxoQuery) -> ClientResult<Vec<Utxo>>;

    /// Excludes an output spent by `spent_by` from further selection.
    async fn mark_spent(&self, outpoint: &OutPoint, spent_by: &Txid) -> ClientResult<()>;

    /// Makes a new output available for selection.
    async fn add_utxo(&self, utxo: Utxo) -> ClientResult<()>;
}

/// A transaction awaiting key-path signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignRequest {
    /// The transaction, any covenant witnesses already attached.
    pub tx: Transaction,

    /// The outputs spent by each input, in order.
    pub prevouts: Vec<TxOut>,

    /// Inputs to sign.
    pub inputs: Vec<usize>,
}

/// The fee wallet.
#[cfg_attr(any(test, feature = "test_utils"), mockall::automock)]
#[async_trait]
pub trait Signer: Sync + Send + 'static {
    /// The key-path address fee outputs are paid to.
    fn address(&self) -> Address;

    /// The wallet key.
    fn public_key(&self) -> XOnlyPublicKey;

    /// Signs the requested inputs of a transaction.
    async fn sign_tx(&self, request: SignRequest) -> ClientResult<Transaction>;

    /// Signs a batch of transactions.
    async fn sign_txs(&self, requests: Vec<SignRequest>) -> ClientResult<Vec<Transaction>> {
        let mut signed = Vec::with_capacity(requests.len());
        for request in requests {
            signed.push(self.sign_tx(request).await?);
        }
        Ok(signed)
    }
}
