//! Ordered publication of transaction batches.

use std::{sync::Arc, time::Duration};

use bitcoin::{Transaction, Txid};
use thiserror::Error;
use tracing::*;

use crate::{
    rpc::error::{ClientError, ClientResult},
    traits::ChainProvider,
};

/// A batch stopped at its first rejected transaction.
///
/// Transactions in `broadcast` are on chain and stay there; the ones after `failed` were never
/// sent.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("broadcast of {failed} failed after {} published: {reason}", .broadcast.len())]
pub struct BroadcastFailure {
    /// Transactions published before the failure, in order.
    pub broadcast: Vec<Txid>,

    /// The transaction that was rejected.
    pub failed: Txid,

    /// Why it was rejected.
    pub reason: ClientError,
}

/// Publishes transactions in order and waits on their confirmation.
#[derive(Debug)]
pub struct BatchBroadcaster<C> {
    chain: Arc<C>,
}

impl<C> Clone for BatchBroadcaster<C> {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
        }
    }
}

impl<C: ChainProvider> BatchBroadcaster<C> {
    pub fn new(chain: Arc<C>) -> Self {
        Self { chain }
    }

    pub fn chain(&self) -> &Arc<C> {
        &self.chain
    }

    /// Broadcasts `txs` one after the other, stopping at the first failure.
    pub async fn broadcast_all(&self, txs: &[Transaction]) -> Result<Vec<Txid>, BroadcastFailure> {
        let mut broadcast = Vec::with_capacity(txs.len());

        for tx in txs {
            match self.chain.broadcast(tx).await {
                Ok(txid) => {
                    info!(%txid, "broadcast transaction");
                    broadcast.push(txid);
                }
                Err(reason) => {
                    let failed = tx.compute_txid();
                    error!(%failed, %reason, published = broadcast.len(), "batch broadcast failed");
                    return Err(BroadcastFailure {
                        broadcast,
                        failed,
                        reason,
                    });
                }
            }
        }

        Ok(broadcast)
    }

    /// Polls until `txid` has at least `confirmations` confirmations.
    ///
    /// Gives up with [`ClientError::Timeout`] after `max_polls` attempts.
    pub async fn wait_for_confirmations(
        &self,
        txid: &Txid,
        confirmations: u64,
        poll_interval: Duration,
        max_polls: u32,
    ) -> ClientResult<u64> {
        let mut interval = tokio::time::interval(poll_interval);

        for _ in 0..max_polls {
            interval.tick().await;

            let got = self.chain.get_confirmations(txid).await?;
            trace!(%txid, %got, "polled confirmations");
            if got >= confirmations {
                return Ok(got);
            }
        }

        warn!(%txid, %confirmations, "transaction not confirmed in time");
        Err(ClientError::Timeout)
    }
}
