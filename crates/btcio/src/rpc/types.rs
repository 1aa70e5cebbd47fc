//! Response types of the `bitcoind` RPCs the chain provider uses.

use bitcoin::{Amount, ScriptBuf, Txid};
use catbridge_primitives::utxo::Utxo;
use serde::{Deserialize, Serialize};

use super::error::{ClientError, ClientResult};

/// An entry of `listunspent`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RawUtxo {
    /// The id of the funding transaction.
    pub txid: String,

    /// The output index.
    pub vout: u32,

    /// The address of the output.
    pub address: String,

    /// The locking script, hex encoded.
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: String,

    /// Value in BTC, not satoshis.
    pub amount: f64,

    /// Number of confirmations.
    pub confirmations: u64,

    /// Whether the wallet can spend the output.
    pub spendable: bool,
}

impl TryFrom<RawUtxo> for Utxo {
    type Error = ClientError;

    fn try_from(raw: RawUtxo) -> ClientResult<Self> {
        let txid = raw
            .txid
            .parse::<Txid>()
            .map_err(|e| ClientError::Parse(e.to_string()))?;
        let script_pubkey =
            ScriptBuf::from_hex(&raw.script_pub_key).map_err(|e| ClientError::Parse(e.to_string()))?;
        let value = Amount::from_btc(raw.amount).map_err(|e| ClientError::Parse(e.to_string()))?;

        Ok(Utxo::new(txid, raw.vout, script_pubkey, value))
    }
}

/// The verbose form of `getrawtransaction`, reduced to what is needed.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RawTransactionInfo {
    /// The transaction id.
    pub txid: String,

    /// Confirmations of the containing block; absent while in the mempool.
    pub confirmations: Option<u64>,
}

/// An outpoint as passed to `lockunspent`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RpcOutPoint {
    /// The transaction id.
    pub txid: String,

    /// The output index.
    pub vout: u32,
}
