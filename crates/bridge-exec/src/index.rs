//! The offchain index.
//!
//! A cache of the states committed by covenant outputs, which only hold their hashes on chain.
//! Nothing read from it is trusted: every state is backtraced against the chain before it is
//! spent.

use std::collections::HashMap;

use bitcoin::Txid;
use catbridge_covenants::state::{AggregationNode, BridgeState};
use parking_lot::RwLock;

/// Lookup of covenant states by the transaction that committed them.
pub trait OffchainIndex: Send + Sync + 'static {
    /// The deposit aggregator node created by `txid`.
    fn get_deposit_info(&self, txid: &Txid) -> Option<AggregationNode>;

    /// Records the deposit aggregator node created by `txid`.
    fn set_deposit_info(&self, txid: Txid, node: AggregationNode);

    /// The bridge state created by `txid`.
    fn get_bridge_state(&self, txid: &Txid) -> Option<BridgeState>;

    /// Records the bridge state created by `txid`.
    fn set_bridge_state(&self, txid: Txid, state: BridgeState);

    /// The transaction holding the current bridge output.
    fn get_latest_bridge_txid(&self) -> Option<Txid>;

    /// Records the transaction holding the current bridge output.
    fn set_latest_bridge_txid(&self, txid: Txid);
}

#[derive(Debug, Default)]
struct IndexInner {
    deposits: HashMap<Txid, AggregationNode>,
    bridge_states: HashMap<Txid, BridgeState>,
    latest_bridge: Option<Txid>,
}

/// An [`OffchainIndex`] kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryIndex {
    inner: RwLock<IndexInner>,
}

impl InMemoryIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }
}

impl OffchainIndex for InMemoryIndex {
    fn get_deposit_info(&self, txid: &Txid) -> Option<AggregationNode> {
        self.inner.read().deposits.get(txid).cloned()
    }

    fn set_deposit_info(&self, txid: Txid, node: AggregationNode) {
        self.inner.write().deposits.insert(txid, node);
    }

    fn get_bridge_state(&self, txid: &Txid) -> Option<BridgeState> {
        self.inner.read().bridge_states.get(txid).cloned()
    }

    fn set_bridge_state(&self, txid: Txid, state: BridgeState) {
        self.inner.write().bridge_states.insert(txid, state);
    }

    fn get_latest_bridge_txid(&self) -> Option<Txid> {
        self.inner.read().latest_bridge
    }

    fn set_latest_bridge_txid(&self, txid: Txid) {
        self.inner.write().latest_bridge = Some(txid);
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::{hashes::Hash, ScriptBuf};
    use catbridge_primitives::buf::Buf32;

    use super::*;

    #[test]
    fn test_in_memory_index() {
        let index = InMemoryIndex::new();
        let txid = Txid::from_byte_array([1; 32]);
        assert!(index.get_latest_bridge_txid().is_none());

        let node = AggregationNode::leaf(Buf32::zero(), 1_000);
        index.set_deposit_info(txid, node.clone());
        assert_eq!(index.get_deposit_info(&txid), Some(node));

        let state = BridgeState::new(ScriptBuf::new());
        index.set_bridge_state(txid, state.clone());
        index.set_latest_bridge_txid(txid);
        assert_eq!(index.get_bridge_state(&txid), Some(state));
        assert_eq!(index.get_latest_bridge_txid(), Some(txid));
        assert!(index.get_bridge_state(&Txid::all_zeros()).is_none());
    }
}
