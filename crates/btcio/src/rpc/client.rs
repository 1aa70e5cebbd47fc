use std::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine};
use bitcoin::{
    consensus::encode::{deserialize_hex, serialize_hex},
    Address, OutPoint, Transaction, Txid,
};
use catbridge_primitives::utxo::Utxo;
use reqwest::{
    header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE},
    Client,
};
use serde::{de, Deserialize, Serialize};
use serde_json::{json, value::Value};
use tokio::time::sleep;
use tracing::*;

use crate::{
    rpc::{
        error::{BitcoinRpcError, ClientError, ClientResult},
        types::{RawTransactionInfo, RawUtxo, RpcOutPoint},
    },
    traits::{ChainProvider, UtxoProvider, UtxoQuery},
};

/// The maximum number of retries for a request.
const MAX_RETRIES: u8 = 3;

/// `bitcoind` error code for a transaction that is already in the chain.
const RPC_VERIFY_ALREADY_IN_CHAIN: i32 = -27;

/// `bitcoind` error code for a transaction rejected by mempool policy or consensus.
const RPC_VERIFY_REJECTED: i32 = -26;

/// `bitcoind` error code for an unknown transaction.
const RPC_INVALID_ADDRESS_OR_KEY: i32 = -5;

/// `bitcoind` error code for a bad parameter, such as locking an output that is already spent.
const RPC_INVALID_PARAMETER: i32 = -8;

/// Custom implementation to convert a value to a `Value` type.
pub fn to_value<T>(value: T) -> ClientResult<Value>
where
    T: Serialize,
{
    serde_json::to_value(value)
        .map_err(|e| ClientError::Param(format!("Error creating value: {}", e)))
}

/// An `async` client for interacting with a `bitcoind` instance.
///
/// The node's wallet must watch the operator's fee address for [`UtxoProvider::get_utxos`] to
/// see its outputs.
#[derive(Debug)]
pub struct BitcoinClient {
    /// The URL of the `bitcoind` instance.
    url: String,
    /// The underlying `async` HTTP client.
    client: Client,
    /// The ID of the current request.
    id: AtomicUsize,
}

/// Response returned by the `bitcoind` RPC server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Response<R> {
    pub result: Option<R>,
    pub error: Option<BitcoinRpcError>,
    pub id: u64,
}

impl BitcoinClient {
    /// Creates a new [`BitcoinClient`] with the given URL, username, and password.
    pub fn new(url: String, username: String, password: String) -> ClientResult<Self> {
        if username.is_empty() || password.is_empty() {
            return Err(ClientError::MissingUserPassword);
        }

        let user_pw = general_purpose::STANDARD.encode(format!("{username}:{password}"));
        let authorization = format!("Basic {user_pw}")
            .parse()
            .map_err(|_| ClientError::Other("Error parsing header".to_string()))?;

        let content_type = "application/json"
            .parse()
            .map_err(|_| ClientError::Other("Error parsing header".to_string()))?;
        let headers =
            HeaderMap::from_iter([(AUTHORIZATION, authorization), (CONTENT_TYPE, content_type)]);

        trace!(headers = ?headers);

        let client = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| ClientError::Other(format!("Could not create client: {e}")))?;

        let id = AtomicUsize::new(0);

        trace!(url = %url, "Created bitcoin client");

        Ok(Self { url, client, id })
    }

    fn next_id(&self) -> usize {
        self.id.fetch_add(1, Ordering::AcqRel)
    }

    /// Height of the most-work fully-validated chain.
    pub async fn get_block_count(&self) -> ClientResult<u64> {
        self.call::<u64>("getblockcount", &[]).await
    }

    async fn call<T: de::DeserializeOwned + fmt::Debug>(
        &self,
        method: &str,
        params: &[Value],
    ) -> ClientResult<T> {
        let mut retries = 0;
        loop {
            trace!(%method, ?params, %retries, "Calling bitcoin client");

            let id = self.next_id();

            let response = self
                .client
                .post(&self.url)
                .json(&json!({
                    "jsonrpc": "1.0",
                    "id": id,
                    "method": method,
                    "params": params
                }))
                .send()
                .await;
            trace!(?response, "Response received");
            match response {
                Ok(resp) => {
                    let data = resp
                        .json::<Response<T>>()
                        .await
                        .map_err(|e| ClientError::Parse(e.to_string()))?;
                    if let Some(err) = data.error {
                        return Err(ClientError::Server(err.code, err.message));
                    }
                    return data
                        .result
                        .ok_or_else(|| ClientError::Other("Empty data received".to_string()));
                }
                Err(err) => {
                    if err.is_body() || err.is_status() || err.is_builder() || err.is_redirect() {
                        warn!(%err, %method, "bitcoind request failed");
                        return Err(ClientError::Transport(err.to_string()));
                    }
                    // connect, timeout, decode and request errors may clear up
                    warn!(%err, %method, %retries, "bitcoind request failed, retrying");
                }
            }
            retries += 1;
            if retries >= MAX_RETRIES {
                return Err(ClientError::MaxRetriesExceeded(MAX_RETRIES));
            }
            sleep(Duration::from_millis(1_000)).await;
        }
    }
}

#[async_trait]
impl ChainProvider for BitcoinClient {
    async fn broadcast(&self, tx: &Transaction) -> ClientResult<Txid> {
        let txstr = serialize_hex(tx);
        trace!(txstr = %txstr, "Sending raw transaction");
        match self
            .call::<Txid>("sendrawtransaction", &[to_value(txstr)?])
            .await
        {
            Ok(txid) => {
                debug!(%txid, "Transaction sent");
                Ok(txid)
            }
            Err(ClientError::Server(code, msg)) => match code {
                RPC_VERIFY_ALREADY_IN_CHAIN => Ok(tx.compute_txid()),
                RPC_VERIFY_REJECTED => Err(ClientError::Rejected(msg)),
                _ => Err(ClientError::Server(code, msg)),
            },
            Err(e) => Err(e),
        }
    }

    async fn get_raw_transaction(&self, txid: &Txid) -> ClientResult<Transaction> {
        let hex = self
            .call::<String>(
                "getrawtransaction",
                &[to_value(txid.to_string())?, to_value(false)?],
            )
            .await
            .map_err(|e| not_found(e, txid))?;

        deserialize_hex::<Transaction>(&hex).map_err(|e| ClientError::Parse(e.to_string()))
    }

    async fn get_confirmations(&self, txid: &Txid) -> ClientResult<u64> {
        let info = self
            .call::<RawTransactionInfo>(
                "getrawtransaction",
                &[to_value(txid.to_string())?, to_value(true)?],
            )
            .await
            .map_err(|e| not_found(e, txid))?;

        Ok(info.confirmations.unwrap_or(0))
    }
}

#[async_trait]
impl UtxoProvider for BitcoinClient {
    async fn get_utxos(&self, address: &Address, query: UtxoQuery) -> ClientResult<Vec<Utxo>> {
        let raw = self
            .call::<Vec<RawUtxo>>(
                "listunspent",
                &[
                    to_value(0)?,
                    to_value(9_999_999)?,
                    to_value([address.to_string()])?,
                ],
            )
            .await?;
        trace!(count = raw.len(), %address, "Got UTXOs");

        let utxos = raw
            .into_iter()
            .filter(|raw| raw.spendable)
            .map(Utxo::try_from)
            .collect::<ClientResult<Vec<_>>>()?;

        Ok(query.select(utxos))
    }

    async fn mark_spent(&self, outpoint: &OutPoint, spent_by: &Txid) -> ClientResult<()> {
        let locked = self
            .call::<bool>(
                "lockunspent",
                &[
                    to_value(false)?,
                    to_value([RpcOutPoint {
                        txid: outpoint.txid.to_string(),
                        vout: outpoint.vout,
                    }])?,
                ],
            )
            .await;

        match locked {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!(%outpoint, %spent_by, "bitcoind refused to lock output");
                Ok(())
            }
            // The wallet already sees the output as spent or does not own it.
            Err(ClientError::Server(RPC_INVALID_PARAMETER, msg)) => {
                trace!(%outpoint, %spent_by, %msg, "output not lockable");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn add_utxo(&self, utxo: Utxo) -> ClientResult<()> {
        // The node's wallet picks up new outputs on its own.
        trace!(outpoint = %utxo.outpoint(), value = %utxo.value, "New fee output");
        Ok(())
    }
}

fn not_found(err: ClientError, txid: &Txid) -> ClientError {
    match err {
        ClientError::Server(RPC_INVALID_ADDRESS_OR_KEY, _) => {
            ClientError::NotFound(txid.to_string())
        }
        other => other,
    }
}
