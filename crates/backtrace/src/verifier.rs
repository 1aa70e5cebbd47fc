//! Tracing covenant outputs back to the transactions that created them.

use std::sync::Arc;

use bitcoin::{OutPoint, ScriptBuf, Transaction, Txid};
use catbridge_btcio::ChainProvider;
use catbridge_covenants::{
    state::{AggregationNode, BridgeState, ExpansionNode},
    tx::CovenantTx,
    Covenant, CovenantSet,
};
use catbridge_primitives::{buf::Buf32, utxo::Utxo};
use futures::future::try_join;
use tracing::*;

use crate::errors::{BacktraceError, BacktraceResult};

/// Rebuilds the covenant form of `raw` and checks that it hashes to `txid`.
pub fn verify_provenance(txid: &Txid, raw: &Transaction) -> BacktraceResult<CovenantTx> {
    let tx = CovenantTx::from_transaction(raw);
    let got = tx.txid();

    if got != *txid || raw.compute_txid() != *txid {
        warn!(expected = %txid, rebuilt = %got, "provenance mismatch");
        return Err(BacktraceError::ProvenanceMismatch {
            expected: *txid,
            got,
        });
    }

    Ok(tx)
}

/// An authenticated aggregator node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatorTrace {
    /// The transaction that created the node.
    pub tx: CovenantTx,

    /// For internal nodes, the transactions that created its two children, in input order.
    pub ancestors: Vec<CovenantTx>,
}

/// Authenticates covenant outputs and their claimed states against a chain.
#[derive(Debug)]
pub struct Backtracer<C> {
    chain: Arc<C>,
    covenants: CovenantSet,
}

impl<C: ChainProvider> Backtracer<C> {
    /// Creates a backtracer for the outputs of `covenants`.
    pub fn new(chain: Arc<C>, covenants: CovenantSet) -> Self {
        Self { chain, covenants }
    }

    /// Fetches `txid` and verifies that its covenant form hashes to it.
    pub async fn fetch_verified(&self, txid: &Txid) -> BacktraceResult<CovenantTx> {
        let raw = self.chain.get_raw_transaction(txid).await?;
        verify_provenance(txid, &raw)
    }

    /// Verifies the bridge output `utxo` carries `state`.
    pub async fn backtrace_bridge(
        &self,
        utxo: &Utxo,
        state: &BridgeState,
    ) -> BacktraceResult<CovenantTx> {
        let tx = self
            .backtrace_output(utxo, &self.covenants.bridge.script_pubkey())
            .await?;
        self.expect_state(&tx, utxo, state.hash(), "bridge state")?;

        debug!(outpoint = %utxo.outpoint(), root = %state.batches_root(), "bridge output verified");
        Ok(tx)
    }

    /// Verifies the aggregator output `utxo` carries `node`.
    ///
    /// For internal nodes the transactions holding the two children are fetched concurrently and
    /// verified in turn; their own history was checked by the aggregator script when they were
    /// merged.
    pub async fn backtrace_aggregator(
        &self,
        utxo: &Utxo,
        node: &AggregationNode,
    ) -> BacktraceResult<AggregatorTrace> {
        let aggregator_spk = self.covenants.deposit_aggregator.script_pubkey();
        let tx = self.backtrace_output(utxo, &aggregator_spk).await?;
        self.expect_state(&tx, utxo, node.hash()?, "aggregator node")?;

        if let AggregationNode::Leaf(deposit) = node {
            if deposit.amount != utxo.value.to_sat() {
                return Err(BacktraceError::StateMismatch {
                    outpoint: utxo.outpoint(),
                    what: "deposit amount",
                });
            }
        }

        let Some((hash0, hash1)) = node.child_hashes() else {
            return Ok(AggregatorTrace {
                tx,
                ancestors: Vec::new(),
            });
        };

        let outpoint0 = tx
            .input_prevout(0)
            .ok_or(BacktraceError::AncestorMismatch(utxo.outpoint()))?;
        let outpoint1 = tx
            .input_prevout(1)
            .ok_or(BacktraceError::AncestorMismatch(utxo.outpoint()))?;

        let (ancestor0, ancestor1) = try_join(
            self.fetch_verified(&outpoint0.txid),
            self.fetch_verified(&outpoint1.txid),
        )
        .await?;

        for (ancestor, outpoint, child_hash) in [
            (&ancestor0, outpoint0, hash0),
            (&ancestor1, outpoint1, hash1),
        ] {
            check_ancestor(ancestor, outpoint, &aggregator_spk, child_hash)?;
        }

        debug!(outpoint = %utxo.outpoint(), level = node.level(), "aggregator node verified");
        Ok(AggregatorTrace {
            tx,
            ancestors: vec![ancestor0, ancestor1],
        })
    }

    /// Verifies the expander output `utxo` carries `node`.
    pub async fn backtrace_expander(
        &self,
        utxo: &Utxo,
        node: &ExpansionNode,
    ) -> BacktraceResult<CovenantTx> {
        let tx = self
            .backtrace_output(utxo, &self.covenants.withdrawal_expander.script_pubkey())
            .await?;
        self.expect_state(&tx, utxo, node.hash()?, "expander node")?;

        if node.amount()? != utxo.value.to_sat() {
            return Err(BacktraceError::StateMismatch {
                outpoint: utxo.outpoint(),
                what: "expander amount",
            });
        }

        debug!(outpoint = %utxo.outpoint(), level = node.level(), "expander node verified");
        Ok(tx)
    }

    async fn backtrace_output(
        &self,
        utxo: &Utxo,
        expected: &ScriptBuf,
    ) -> BacktraceResult<CovenantTx> {
        if utxo.script_pubkey != *expected {
            return Err(BacktraceError::OutputMismatch(utxo.outpoint()));
        }

        let tx = self.fetch_verified(&utxo.txid).await?;
        let out = tx.output(utxo.vout)?;
        if out.script != expected.as_bytes() || out.value != utxo.value.to_sat() {
            return Err(BacktraceError::OutputMismatch(utxo.outpoint()));
        }

        Ok(tx)
    }

    fn expect_state(
        &self,
        tx: &CovenantTx,
        utxo: &Utxo,
        expected: Buf32,
        what: &'static str,
    ) -> BacktraceResult<()> {
        if tx.state_hash_for(utxo.vout)? != expected {
            return Err(BacktraceError::StateMismatch {
                outpoint: utxo.outpoint(),
                what,
            });
        }
        Ok(())
    }
}

fn check_ancestor(
    ancestor: &CovenantTx,
    outpoint: OutPoint,
    aggregator_spk: &ScriptBuf,
    child_hash: Buf32,
) -> BacktraceResult<()> {
    let out = ancestor.output(outpoint.vout)?;
    if out.script != aggregator_spk.as_bytes() {
        return Err(BacktraceError::AncestorMismatch(outpoint));
    }
    if ancestor.state_hash_for(outpoint.vout)? != child_hash {
        return Err(BacktraceError::StateMismatch {
            outpoint,
            what: "ancestor node",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use bitcoin::{
        absolute::LockTime, transaction::Version, Amount, Network, Sequence, TxIn, TxOut, Witness,
    };
    use catbridge_btcio::traits::MockChainProvider;
    use catbridge_covenants::{deposit_aggregator::AGGREGATOR_VOUT, tx::state_output};
    use catbridge_test_utils::{
        bitcoin::{funding_tx, generate_keypair},
        chain::MockChain,
        random_buf32,
    };

    use super::*;

    const DEPOSIT: u64 = 100_000_000;

    fn setup() -> (Arc<MockChain>, CovenantSet) {
        let operator = generate_keypair().x_only_public_key().0;
        let set = CovenantSet::derive(&operator, Network::Regtest).unwrap();
        (Arc::new(MockChain::new(operator)), set)
    }

    fn deposit(chain: &MockChain, set: &CovenantSet) -> (Transaction, AggregationNode) {
        let node = AggregationNode::leaf(random_buf32(), DEPOSIT);
        let tx = funding_tx(vec![
            state_output(&[node.hash().unwrap()]).unwrap(),
            set.deposit_aggregator.contract_output(DEPOSIT),
        ]);
        chain.fund(&tx);
        (tx, node)
    }

    fn aggregate(
        chain: &MockChain,
        set: &CovenantSet,
        children: [&(Transaction, AggregationNode); 2],
    ) -> (Transaction, AggregationNode) {
        let node = AggregationNode::merge(&children[0].1, &children[1].1).unwrap();
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: children
                .iter()
                .map(|(tx, _)| TxIn {
                    previous_output: OutPoint::new(tx.compute_txid(), AGGREGATOR_VOUT),
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::new(),
                })
                .collect(),
            output: vec![
                state_output(&[node.hash().unwrap()]).unwrap(),
                set.deposit_aggregator.contract_output(2 * DEPOSIT),
            ],
        };
        chain.fund(&tx);
        (tx, node)
    }

    fn utxo(tx: &Transaction) -> Utxo {
        Utxo::from_tx_output(tx, AGGREGATOR_VOUT).unwrap()
    }

    #[test]
    fn test_verify_provenance() {
        let tx = funding_tx(vec![TxOut {
            value: Amount::from_sat(1),
            script_pubkey: ScriptBuf::new(),
        }]);
        let txid = tx.compute_txid();
        assert!(verify_provenance(&txid, &tx).is_ok());

        let mut tampered = tx.clone();
        tampered.output[0].value = Amount::from_sat(2);
        assert!(matches!(
            verify_provenance(&txid, &tampered),
            Err(BacktraceError::ProvenanceMismatch { expected, .. }) if expected == txid
        ));
    }

    #[tokio::test]
    async fn test_backtrace_leaf() {
        let (chain, set) = setup();
        let leaf = deposit(&chain, &set);
        let backtracer = Backtracer::new(chain.clone(), set);

        let trace = backtracer
            .backtrace_aggregator(&utxo(&leaf.0), &leaf.1)
            .await
            .unwrap();
        assert_eq!(trace.tx, CovenantTx::from_transaction(&leaf.0));
        assert!(trace.ancestors.is_empty());

        let other = AggregationNode::leaf(Buf32::zero(), DEPOSIT);
        let res = backtracer.backtrace_aggregator(&utxo(&leaf.0), &other).await;
        assert!(matches!(res, Err(BacktraceError::StateMismatch { .. })));
    }

    #[tokio::test]
    async fn test_backtrace_internal_node_returns_ancestors() {
        let (chain, set) = setup();
        let leaf0 = deposit(&chain, &set);
        let leaf1 = deposit(&chain, &set);
        let parent = aggregate(&chain, &set, [&leaf0, &leaf1]);
        let backtracer = Backtracer::new(chain.clone(), set);

        let trace = backtracer
            .backtrace_aggregator(&utxo(&parent.0), &parent.1)
            .await
            .unwrap();
        assert_eq!(
            trace.ancestors,
            vec![
                CovenantTx::from_transaction(&leaf0.0),
                CovenantTx::from_transaction(&leaf1.0),
            ]
        );
    }

    #[tokio::test]
    async fn test_backtrace_rejects_swapped_children() {
        let (chain, set) = setup();
        let leaf0 = deposit(&chain, &set);
        let leaf1 = deposit(&chain, &set);
        let parent = aggregate(&chain, &set, [&leaf0, &leaf1]);
        let backtracer = Backtracer::new(chain.clone(), set);

        let swapped = AggregationNode::merge(&leaf1.1, &leaf0.1).unwrap();
        let res = backtracer.backtrace_aggregator(&utxo(&parent.0), &swapped).await;
        assert!(matches!(res, Err(BacktraceError::StateMismatch { .. })));
    }

    #[tokio::test]
    async fn test_tampered_tx_stops_before_ancestors() {
        let (chain, set) = setup();
        let leaf0 = deposit(&chain, &set);
        let leaf1 = deposit(&chain, &set);
        let parent = aggregate(&chain, &set, [&leaf0, &leaf1]);

        let mut tampered = parent.0.clone();
        tampered.lock_time = LockTime::from_consensus(1);

        let mut provider = MockChainProvider::new();
        provider
            .expect_get_raw_transaction()
            .times(1)
            .returning(move |_| Ok(tampered.clone()));
        let backtracer = Backtracer::new(Arc::new(provider), set);

        let res = backtracer
            .backtrace_aggregator(&utxo(&parent.0), &parent.1)
            .await;
        assert!(matches!(
            res,
            Err(BacktraceError::ProvenanceMismatch { expected, .. }) if expected == parent.0.compute_txid()
        ));
    }

    #[tokio::test]
    async fn test_backtrace_rejects_foreign_output() {
        let (chain, set) = setup();
        let leaf = deposit(&chain, &set);
        let backtracer = Backtracer::new(chain.clone(), set.clone());

        let mut claimed = utxo(&leaf.0);
        claimed.value = Amount::from_sat(DEPOSIT + 1);
        let res = backtracer.backtrace_aggregator(&claimed, &leaf.1).await;
        assert!(matches!(res, Err(BacktraceError::OutputMismatch(_))));

        let bridge = BridgeState::new(set.deposit_aggregator.script_pubkey());
        let res = backtracer.backtrace_bridge(&utxo(&leaf.0), &bridge).await;
        assert!(matches!(res, Err(BacktraceError::OutputMismatch(_))));
    }

    #[tokio::test]
    async fn test_backtrace_expander() {
        let (chain, set) = setup();
        let withdrawal = catbridge_covenants::state::Withdrawal::new(
            &set.bridge.script_pubkey(),
            50_000,
        )
        .unwrap();
        let node = ExpansionNode::Leaf(withdrawal);
        let tx = funding_tx(vec![
            state_output(&[Buf32::zero(), node.hash().unwrap()]).unwrap(),
            set.bridge.contract_output(0),
            set.withdrawal_expander.contract_output(50_000),
        ]);
        chain.fund(&tx);
        let backtracer = Backtracer::new(chain.clone(), set);

        let expander = Utxo::from_tx_output(&tx, 2).unwrap();
        let verified = backtracer.backtrace_expander(&expander, &node).await.unwrap();
        assert_eq!(verified.txid(), tx.compute_txid());
    }
}
