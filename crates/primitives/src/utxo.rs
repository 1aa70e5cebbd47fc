//! UTXO wrappers.

use bitcoin::{Amount, OutPoint, ScriptBuf, TxOut, Txid};
use serde::{Deserialize, Serialize};

/// An unspent output as reported by a UTXO provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Utxo {
    /// The id of the transaction that created the output.
    pub txid: Txid,

    /// The index of the output in that transaction.
    pub vout: u32,

    /// The locking script of the output.
    pub script_pubkey: ScriptBuf,

    /// The value of the output.
    pub value: Amount,
}

impl Utxo {
    /// Creates a new [`Utxo`].
    pub fn new(txid: Txid, vout: u32, script_pubkey: ScriptBuf, value: Amount) -> Self {
        Self {
            txid,
            vout,
            script_pubkey,
            value,
        }
    }

    /// Builds the [`Utxo`] for output `vout` of a transaction.
    pub fn from_tx_output(tx: &bitcoin::Transaction, vout: u32) -> Option<Self> {
        let out = tx.output.get(vout as usize)?;
        Some(Self::new(
            tx.compute_txid(),
            vout,
            out.script_pubkey.clone(),
            out.value,
        ))
    }

    /// The outpoint referencing this output.
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout)
    }

    /// The [`TxOut`] this UTXO represents, as needed for sighash computation.
    pub fn txout(&self) -> TxOut {
        TxOut {
            value: self.value,
            script_pubkey: self.script_pubkey.clone(),
        }
    }
}

/// A covenant output together with the typed state it commits to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CovenantUtxo<S> {
    /// The state committed by the transaction that created [`Self::utxo`].
    pub state: S,

    /// The chain output.
    pub utxo: Utxo,
}

impl<S> CovenantUtxo<S> {
    /// Creates a new [`CovenantUtxo`].
    pub fn new(state: S, utxo: Utxo) -> Self {
        Self { state, utxo }
    }

    /// Returns `true` if the output is locked by `expected`.
    pub fn has_script(&self, expected: &ScriptBuf) -> bool {
        &self.utxo.script_pubkey == expected
    }
}
