//! The operator state and its transition functions.
//!
//! [`OperatorState`] is a plain value. Events from the outside world and the outcomes of the
//! transactions the driver publishes are folded into it one at a time, and
//! [`OperatorState::next_action`] derives the next step from it. None of these functions touch
//! the chain.

use std::collections::BTreeSet;

use bitcoin::{OutPoint, Txid};
use catbridge_covenants::state::Withdrawal;
use catbridge_primitives::buf::Buf32;
use serde::{Deserialize, Serialize};
use tracing::*;

use crate::{
    operator::{BridgeOutput, DepositEntry, ExpanderEntry},
    policy::{DepositPolicy, WithdrawalPolicy},
};

/// Something the operator learned from outside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// A new L1 block.
    NewBlock {
        /// Height of the block.
        height: u64,

        /// Block time, in seconds since the epoch.
        time: u64,
    },

    /// A depositor created a level-0 aggregator output.
    DepositObserved {
        /// The deposit output and its leaf.
        deposit: DepositEntry,

        /// When the deposit was seen, in seconds since the epoch.
        time: u64,
    },

    /// L2 credited the deposits of a finalized batch.
    DepositsVerifiedOnL2 {
        /// The batch credited.
        batch_id: Buf32,
    },

    /// L2 closed a batch of withdrawals.
    WithdrawalBatchClosed {
        /// The withdrawals of the batch, in order.
        withdrawals: Vec<Withdrawal>,
    },

    /// A transaction reached the confirmation depth.
    TxConfirmed {
        /// The transaction.
        txid: Txid,
    },
}

/// A deposit not yet assigned to a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDeposit {
    /// The deposit output.
    pub deposit: DepositEntry,

    /// When the deposit was observed.
    pub observed_at: u64,
}

/// Lifecycle of a deposit batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepositBatch {
    /// The unspent aggregator outputs of the batch, in tree order.
    Aggregating {
        /// Live nodes, left to right.
        nodes: Vec<DepositEntry>,
    },

    /// The root was merged into the bridge.
    FinalizedL1 {
        /// Id of the batch in the bridge.
        batch_id: Buf32,

        /// Slot the batch occupies.
        slot: usize,

        /// Total deposited.
        amount: u64,

        /// Whether L2 credited the batch.
        verified_on_l2: bool,
    },

    /// The slot was cleared again.
    Completed {
        /// Id the batch had.
        batch_id: Buf32,
    },
}

/// Lifecycle of a withdrawal batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WithdrawalBatch {
    /// Closed on L2, still in the bridge.
    Pending {
        /// The withdrawals of the batch.
        withdrawals: Vec<Withdrawal>,
    },

    /// Left the bridge; `nodes` are the unspent expander outputs.
    Expanding {
        /// The withdrawals of the batch.
        withdrawals: Vec<Withdrawal>,

        /// Live expander outputs.
        nodes: Vec<ExpanderEntry>,
    },

    /// Every withdrawal was paid.
    Distributed {
        /// Number of payouts.
        count: usize,

        /// Total paid.
        total: u64,
    },
}

/// The next step the driver should take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Group pending deposits into a new batch.
    OpenDepositBatch {
        /// The deposits, in observation order.
        deposits: Vec<OutPoint>,
    },

    /// Merge sibling nodes of a batch, one transaction per pair.
    Aggregate {
        /// Index of the batch.
        batch: usize,

        /// The pairs, left node first.
        pairs: Vec<(DepositEntry, DepositEntry)>,
    },

    /// Merge the root of a batch into the bridge.
    FinalizeL1 {
        /// Index of the batch.
        batch: usize,

        /// The root.
        root: DepositEntry,
    },

    /// Clear the slot of a batch L2 credited.
    FinalizeL2 {
        /// Index of the batch.
        batch: usize,

        /// Id of the batch.
        batch_id: Buf32,
    },

    /// Move a withdrawal batch out of the bridge.
    CreateWithdrawal {
        /// Index of the batch.
        batch: usize,
    },

    /// Split expander nodes above the distribute threshold.
    Expand {
        /// Index of the batch.
        batch: usize,

        /// The nodes.
        nodes: Vec<ExpanderEntry>,
    },

    /// Pay out expander nodes at or below the distribute threshold.
    Distribute {
        /// Index of the batch.
        batch: usize,

        /// The nodes.
        nodes: Vec<ExpanderEntry>,
    },
}

/// What executing an [`Action`] produced.
///
/// Consumed outputs are named by outpoint, so that an outcome covering only part of an action
/// applies cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Pending deposits were grouped into a new batch.
    DepositBatchOpened {
        /// The deposits moved.
        deposits: Vec<OutPoint>,
    },

    /// Pairs were merged.
    Aggregated {
        /// Index of the batch.
        batch: usize,

        /// The two nodes spent and the parent created, per pair.
        merged: Vec<(OutPoint, OutPoint, DepositEntry)>,

        /// The transactions.
        txids: Vec<Txid>,
    },

    /// The root of a batch was merged into the bridge.
    FinalizedL1 {
        /// Index of the batch.
        batch: usize,

        /// The new bridge output.
        bridge: BridgeOutput,

        /// Id of the batch.
        batch_id: Buf32,

        /// Slot of the batch.
        slot: usize,

        /// Total of the batch.
        amount: u64,

        /// The transaction.
        txid: Txid,
    },

    /// The slot of a batch was cleared.
    FinalizedL2 {
        /// Index of the batch.
        batch: usize,

        /// The new bridge output.
        bridge: BridgeOutput,

        /// The transaction.
        txid: Txid,
    },

    /// A withdrawal batch left the bridge.
    WithdrawalCreated {
        /// Index of the batch.
        batch: usize,

        /// The new bridge output.
        bridge: BridgeOutput,

        /// The expander root.
        expander: ExpanderEntry,

        /// The transaction.
        txid: Txid,
    },

    /// Expander nodes were split.
    Expanded {
        /// Index of the batch.
        batch: usize,

        /// Each node spent and its children.
        expanded: Vec<(OutPoint, Vec<ExpanderEntry>)>,

        /// The transactions.
        txids: Vec<Txid>,
    },

    /// Expander nodes were paid out.
    Distributed {
        /// Index of the batch.
        batch: usize,

        /// The nodes spent.
        spent: Vec<OutPoint>,

        /// The transactions.
        txids: Vec<Txid>,
    },

    /// The action failed before anything was broadcast.
    Failed {
        /// The action.
        action: Action,

        /// Why it failed.
        reason: String,
    },
}

/// Everything the operator tracks between events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperatorState {
    /// Latest L1 height seen.
    pub height: u64,

    /// Latest L1 block time seen.
    pub time: u64,

    /// The current bridge output.
    pub bridge: Option<BridgeOutput>,

    /// Deposits not yet in a batch, oldest first.
    pub pending_deposits: Vec<PendingDeposit>,

    /// Deposit batches, by index.
    pub deposit_batches: Vec<DepositBatch>,

    /// Withdrawal batches, by index.
    pub withdrawal_batches: Vec<WithdrawalBatch>,

    /// Transactions of tracked outputs not yet confirmed.
    pub unconfirmed: BTreeSet<Txid>,

    /// Failed actions, skipped until the next block or the next bridge spend.
    pub deferred: Vec<Action>,
}

impl OperatorState {
    /// A state tracking `bridge`, created by a transaction not yet confirmed.
    pub fn new(bridge: BridgeOutput) -> Self {
        let mut unconfirmed = BTreeSet::new();
        unconfirmed.insert(bridge.utxo.txid);
        Self {
            bridge: Some(bridge),
            unconfirmed,
            ..Default::default()
        }
    }

    fn is_confirmed(&self, txid: &Txid) -> bool {
        !self.unconfirmed.contains(txid)
    }

    /// The bridge output, if it may be spent.
    fn spendable_bridge(&self) -> Option<&BridgeOutput> {
        self.bridge
            .as_ref()
            .filter(|bridge| self.is_confirmed(&bridge.utxo.txid))
    }

    /// Folds an external event in.
    pub fn apply(mut self, event: &Event) -> Self {
        match event {
            Event::NewBlock { height, time } => {
                if *height < self.height {
                    warn!(%height, current = %self.height, "block below current height");
                }
                self.height = *height;
                self.time = *time;
                self.deferred.clear();
            }

            Event::DepositObserved { deposit, time } => {
                let outpoint = deposit.utxo.outpoint();
                if !deposit.state.is_leaf() {
                    warn!(%outpoint, "ignoring deposit that is not a leaf");
                    return self;
                }
                if self.tracks_deposit(&outpoint) {
                    debug!(%outpoint, "deposit already tracked");
                    return self;
                }
                self.unconfirmed.insert(deposit.utxo.txid);
                self.pending_deposits.push(PendingDeposit {
                    deposit: deposit.clone(),
                    observed_at: *time,
                });
            }

            Event::DepositsVerifiedOnL2 { batch_id } => {
                let found = self.deposit_batches.iter_mut().find_map(|batch| match batch {
                    DepositBatch::FinalizedL1 {
                        batch_id: id,
                        verified_on_l2,
                        ..
                    } if id == batch_id => Some(verified_on_l2),
                    _ => None,
                });
                match found {
                    Some(verified) => *verified = true,
                    None => warn!(%batch_id, "L2 verified a batch not finalized on L1"),
                }
            }

            Event::WithdrawalBatchClosed { withdrawals } => {
                let payouts: Vec<Withdrawal> = withdrawals
                    .iter()
                    .filter(|w| !w.is_placeholder())
                    .cloned()
                    .collect();
                if payouts.is_empty() {
                    warn!("ignoring empty withdrawal batch");
                    return self;
                }
                if payouts.len() < withdrawals.len() {
                    warn!(
                        dropped = withdrawals.len() - payouts.len(),
                        "dropping zero-amount withdrawals"
                    );
                }
                self.withdrawal_batches.push(WithdrawalBatch::Pending {
                    withdrawals: payouts,
                });
            }

            Event::TxConfirmed { txid } => {
                self.unconfirmed.remove(txid);
            }
        }

        self
    }

    fn tracks_deposit(&self, outpoint: &OutPoint) -> bool {
        let pending = self
            .pending_deposits
            .iter()
            .any(|p| p.deposit.utxo.outpoint() == *outpoint);
        let batched = self.deposit_batches.iter().any(|batch| match batch {
            DepositBatch::Aggregating { nodes } => {
                nodes.iter().any(|n| n.utxo.outpoint() == *outpoint)
            }
            _ => false,
        });
        pending || batched
    }

    /// Folds the outcome of an executed action in.
    pub fn apply_outcome(mut self, outcome: Outcome) -> Self {
        match outcome {
            Outcome::DepositBatchOpened { deposits } => {
                let mut nodes = Vec::with_capacity(deposits.len());
                for outpoint in &deposits {
                    if let Some(pos) = self
                        .pending_deposits
                        .iter()
                        .position(|p| p.deposit.utxo.outpoint() == *outpoint)
                    {
                        nodes.push(self.pending_deposits.remove(pos).deposit);
                    }
                }
                self.deposit_batches
                    .push(DepositBatch::Aggregating { nodes });
            }

            Outcome::Aggregated {
                batch,
                merged,
                txids,
            } => {
                if let Some(DepositBatch::Aggregating { nodes }) =
                    self.deposit_batches.get_mut(batch)
                {
                    for (left, right, parent) in merged {
                        let Some(pos) = nodes.iter().position(|n| n.utxo.outpoint() == left)
                        else {
                            warn!(%batch, %left, "merged node not in batch");
                            continue;
                        };
                        nodes[pos] = parent;
                        nodes.retain(|n| n.utxo.outpoint() != right);
                    }
                }
                self.unconfirmed.extend(txids);
            }

            Outcome::FinalizedL1 {
                batch,
                bridge,
                batch_id,
                slot,
                amount,
                txid,
            } => {
                if let Some(entry) = self.deposit_batches.get_mut(batch) {
                    *entry = DepositBatch::FinalizedL1 {
                        batch_id,
                        slot,
                        amount,
                        verified_on_l2: false,
                    };
                }
                self.bridge = Some(bridge);
                self.unconfirmed.insert(txid);
                self.deferred.clear();
            }

            Outcome::FinalizedL2 {
                batch,
                bridge,
                txid,
            } => {
                if let Some(entry) = self.deposit_batches.get_mut(batch) {
                    if let DepositBatch::FinalizedL1 { batch_id, .. } = entry {
                        *entry = DepositBatch::Completed {
                            batch_id: *batch_id,
                        };
                    }
                }
                self.bridge = Some(bridge);
                self.unconfirmed.insert(txid);
                self.deferred.clear();
            }

            Outcome::WithdrawalCreated {
                batch,
                bridge,
                expander,
                txid,
            } => {
                if let Some(entry) = self.withdrawal_batches.get_mut(batch) {
                    if let WithdrawalBatch::Pending { withdrawals } = entry {
                        *entry = WithdrawalBatch::Expanding {
                            withdrawals: std::mem::take(withdrawals),
                            nodes: vec![expander],
                        };
                    }
                }
                self.bridge = Some(bridge);
                self.unconfirmed.insert(txid);
                self.deferred.clear();
            }

            Outcome::Expanded {
                batch,
                expanded,
                txids,
            } => {
                if let Some(WithdrawalBatch::Expanding { nodes, .. }) =
                    self.withdrawal_batches.get_mut(batch)
                {
                    for (spent, children) in expanded {
                        nodes.retain(|n| n.utxo.outpoint() != spent);
                        nodes.extend(children);
                    }
                    nodes.sort_by_key(|n| (n.state.level, n.state.index));
                }
                self.unconfirmed.extend(txids);
            }

            Outcome::Distributed {
                batch,
                spent,
                txids,
            } => {
                if let Some(entry) = self.withdrawal_batches.get_mut(batch) {
                    if let WithdrawalBatch::Expanding { withdrawals, nodes } = entry {
                        nodes.retain(|n| !spent.contains(&n.utxo.outpoint()));
                        if nodes.is_empty() {
                            let paid: Vec<_> =
                                withdrawals.iter().filter(|w| !w.is_placeholder()).collect();
                            let count = paid.len();
                            let total = paid.iter().map(|w| w.amount()).sum();
                            *entry = WithdrawalBatch::Distributed { count, total };
                        }
                    }
                }
                self.unconfirmed.extend(txids);
            }

            Outcome::Failed { action, reason } => {
                warn!(?action, %reason, "deferring failed action");
                if !self.deferred.contains(&action) {
                    self.deferred.push(action);
                }
            }
        }

        self
    }

    /// Derives the next step, if any.
    ///
    /// Only outputs of confirmed transactions are spent. Steps spending the bridge come first
    /// since the bridge is a single output and every other path eventually waits on it.
    pub fn next_action(
        &self,
        deposit_policy: &DepositPolicy,
        withdrawal_policy: &WithdrawalPolicy,
    ) -> Option<Action> {
        if let Some(action) = self.next_bridge_action() {
            return Some(action);
        }

        for (batch, entry) in self.deposit_batches.iter().enumerate() {
            let DepositBatch::Aggregating { nodes } = entry else {
                continue;
            };
            let pairs = self.pairs(nodes);
            if !pairs.is_empty() {
                let action = Action::Aggregate { batch, pairs };
                if !self.is_deferred(&action) {
                    return Some(action);
                }
            }
        }

        for (batch, entry) in self.withdrawal_batches.iter().enumerate() {
            let WithdrawalBatch::Expanding { nodes, .. } = entry else {
                continue;
            };
            let (distributable, expandable): (Vec<_>, Vec<_>) = nodes
                .iter()
                .filter(|n| self.is_confirmed(&n.utxo.txid))
                .cloned()
                .partition(|n| withdrawal_policy.distributes(n.state.level));
            let candidates = [
                (!expandable.is_empty()).then_some(Action::Expand {
                    batch,
                    nodes: expandable,
                }),
                (!distributable.is_empty()).then_some(Action::Distribute {
                    batch,
                    nodes: distributable,
                }),
            ];
            if let Some(action) = candidates
                .into_iter()
                .flatten()
                .find(|action| !self.is_deferred(action))
            {
                return Some(action);
            }
        }

        let confirmed: Vec<_> = self
            .pending_deposits
            .iter()
            .filter(|p| self.is_confirmed(&p.deposit.utxo.txid))
            .collect();
        let oldest_age = confirmed
            .first()
            .map(|p| self.time.saturating_sub(p.observed_at))
            .unwrap_or_default();
        let count = deposit_policy.ready(confirmed.len(), oldest_age)?;
        Some(Action::OpenDepositBatch {
            deposits: confirmed
                .iter()
                .take(count)
                .map(|p| p.deposit.utxo.outpoint())
                .collect(),
        })
    }

    fn next_bridge_action(&self) -> Option<Action> {
        self.spendable_bridge()?;

        let deposits = self
            .deposit_batches
            .iter()
            .enumerate()
            .filter_map(|(batch, entry)| match entry {
                DepositBatch::FinalizedL1 {
                    batch_id,
                    verified_on_l2: true,
                    ..
                } => Some(Action::FinalizeL2 {
                    batch,
                    batch_id: *batch_id,
                }),
                DepositBatch::Aggregating { nodes } => match nodes.as_slice() {
                    [root] if self.is_confirmed(&root.utxo.txid) => Some(Action::FinalizeL1 {
                        batch,
                        root: root.clone(),
                    }),
                    _ => None,
                },
                _ => None,
            });
        let withdrawals = self
            .withdrawal_batches
            .iter()
            .enumerate()
            .filter(|(_, entry)| matches!(entry, WithdrawalBatch::Pending { .. }))
            .map(|(batch, _)| Action::CreateWithdrawal { batch });

        deposits
            .chain(withdrawals)
            .find(|action| !self.is_deferred(action))
    }

    fn is_deferred(&self, action: &Action) -> bool {
        self.deferred.contains(action)
    }

    /// Consecutive confirmed siblings on the same level, without overlap.
    fn pairs(&self, nodes: &[DepositEntry]) -> Vec<(DepositEntry, DepositEntry)> {
        let mut pairs = Vec::new();
        let mut i = 0;
        while i + 1 < nodes.len() {
            let (left, right) = (&nodes[i], &nodes[i + 1]);
            if left.state.level() == right.state.level()
                && self.is_confirmed(&left.utxo.txid)
                && self.is_confirmed(&right.utxo.txid)
            {
                pairs.push((left.clone(), right.clone()));
                i += 2;
            } else {
                i += 1;
            }
        }
        pairs
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::{hashes::Hash, Amount, ScriptBuf};
    use catbridge_covenants::state::{AggregationNode, BridgeState};
    use catbridge_primitives::utxo::{CovenantUtxo, Utxo};
    use catbridge_test_utils::bitcoin::random_p2tr_script;

    use super::*;
    use crate::operator::ExpanderPosition;

    fn txid(seed: u8) -> Txid {
        Txid::from_byte_array([seed; 32])
    }

    fn utxo(seed: u8, amount: u64) -> Utxo {
        Utxo::new(txid(seed), 1, ScriptBuf::new(), Amount::from_sat(amount))
    }

    fn leaf(seed: u8) -> DepositEntry {
        CovenantUtxo::new(AggregationNode::leaf(Buf32([seed; 32]), 1_000), utxo(seed, 1_000))
    }

    fn bridge(seed: u8) -> BridgeOutput {
        CovenantUtxo::new(BridgeState::new(ScriptBuf::new()), utxo(seed, 10_000))
    }

    fn confirmed(mut state: OperatorState) -> OperatorState {
        state.unconfirmed.clear();
        state
    }

    fn observe(state: OperatorState, seeds: &[u8], time: u64) -> OperatorState {
        seeds.iter().fold(state, |state, seed| {
            state.apply(&Event::DepositObserved {
                deposit: leaf(*seed),
                time,
            })
        })
    }

    fn policies(batch_size: usize) -> (DepositPolicy, WithdrawalPolicy) {
        (
            DepositPolicy {
                batch_size,
                max_age_secs: 100,
            },
            WithdrawalPolicy::default(),
        )
    }

    #[test]
    fn test_unconfirmed_outputs_are_not_spent() {
        let (deposits, withdrawals) = policies(2);
        let state = observe(OperatorState::new(bridge(0xbb)), &[1, 2], 0);
        assert_eq!(state.next_action(&deposits, &withdrawals), None);

        let state = state.apply(&Event::TxConfirmed { txid: txid(1) });
        assert_eq!(state.next_action(&deposits, &withdrawals), None);

        let state = state.apply(&Event::TxConfirmed { txid: txid(2) });
        assert_eq!(
            state.next_action(&deposits, &withdrawals),
            Some(Action::OpenDepositBatch {
                deposits: vec![leaf(1).utxo.outpoint(), leaf(2).utxo.outpoint()],
            })
        );
    }

    #[test]
    fn test_duplicate_deposit_ignored() {
        let state = observe(OperatorState::default(), &[1, 1], 0);
        assert_eq!(state.pending_deposits.len(), 1);
    }

    #[test]
    fn test_aged_deposits_open_smaller_batch() {
        let (deposits, withdrawals) = policies(4);
        let state = confirmed(observe(OperatorState::new(bridge(0xbb)), &[1, 2, 3], 10));
        assert_eq!(state.next_action(&deposits, &withdrawals), None);

        let state = state.apply(&Event::NewBlock {
            height: 1,
            time: 110,
        });
        let Some(Action::OpenDepositBatch { deposits: opened }) =
            state.next_action(&deposits, &withdrawals)
        else {
            panic!("expected a batch to open");
        };
        assert_eq!(opened.len(), 2);
    }

    #[test]
    fn test_deposit_batch_lifecycle() {
        let (deposits, withdrawals) = policies(2);
        let state = confirmed(observe(OperatorState::new(bridge(0xbb)), &[1, 2], 0));

        let Some(Action::OpenDepositBatch { deposits: opened }) =
            state.next_action(&deposits, &withdrawals)
        else {
            panic!("expected a batch to open");
        };
        let state = state.apply_outcome(Outcome::DepositBatchOpened { deposits: opened });
        assert!(state.pending_deposits.is_empty());

        let Some(Action::Aggregate { batch, pairs }) = state.next_action(&deposits, &withdrawals)
        else {
            panic!("expected an aggregation");
        };
        assert_eq!(pairs.len(), 1);

        let (left, right) = &pairs[0];
        let parent = CovenantUtxo::new(
            AggregationNode::merge(&left.state, &right.state).unwrap(),
            utxo(0xa0, 2_000),
        );
        let state = state.apply_outcome(Outcome::Aggregated {
            batch,
            merged: vec![(left.utxo.outpoint(), right.utxo.outpoint(), parent.clone())],
            txids: vec![txid(0xa0)],
        });
        assert_eq!(state.next_action(&deposits, &withdrawals), None);

        let state = state.apply(&Event::TxConfirmed { txid: txid(0xa0) });
        assert_eq!(
            state.next_action(&deposits, &withdrawals),
            Some(Action::FinalizeL1 {
                batch,
                root: parent
            })
        );

        let id = Buf32([0x1d; 32]);
        let state = confirmed(state.apply_outcome(Outcome::FinalizedL1 {
            batch,
            bridge: bridge(0xbc),
            batch_id: id,
            slot: 0,
            amount: 2_000,
            txid: txid(0xbc),
        }));
        assert_eq!(state.next_action(&deposits, &withdrawals), None);

        let state = state.apply(&Event::DepositsVerifiedOnL2 { batch_id: id });
        assert_eq!(
            state.next_action(&deposits, &withdrawals),
            Some(Action::FinalizeL2 { batch, batch_id: id })
        );

        let state = state.apply_outcome(Outcome::FinalizedL2 {
            batch,
            bridge: bridge(0xbd),
            txid: txid(0xbd),
        });
        assert_eq!(
            state.deposit_batches[batch],
            DepositBatch::Completed { batch_id: id }
        );
    }

    #[test]
    fn test_pairs_skip_unequal_levels() {
        let state = OperatorState::default();
        let parent = CovenantUtxo::new(
            AggregationNode::merge(&leaf(1).state, &leaf(2).state).unwrap(),
            utxo(0xa0, 2_000),
        );
        let nodes = vec![parent, leaf(3), leaf(4)];

        let pairs = state.pairs(&nodes);
        assert_eq!(pairs, vec![(leaf(3), leaf(4))]);
    }

    #[test]
    fn test_withdrawal_batch_lifecycle() {
        let (deposits, withdrawals) = policies(4);
        let closed: Vec<_> = [300, 200, 100, 50, 25]
            .iter()
            .map(|amount| Withdrawal::new(&random_p2tr_script(), *amount).unwrap())
            .collect();
        let state = confirmed(OperatorState::new(bridge(0xbb))).apply(
            &Event::WithdrawalBatchClosed {
                withdrawals: closed.clone(),
            },
        );
        assert_eq!(
            state.next_action(&deposits, &withdrawals),
            Some(Action::CreateWithdrawal { batch: 0 })
        );

        let root = CovenantUtxo::new(ExpanderPosition { level: 3, index: 0 }, utxo(0xe0, 675));
        let state = confirmed(state.apply_outcome(Outcome::WithdrawalCreated {
            batch: 0,
            bridge: bridge(0xbc),
            expander: root.clone(),
            txid: txid(0xe0),
        }));
        assert_eq!(
            state.next_action(&deposits, &withdrawals),
            Some(Action::Expand {
                batch: 0,
                nodes: vec![root.clone()]
            })
        );

        let left = CovenantUtxo::new(ExpanderPosition { level: 2, index: 0 }, utxo(0xe1, 650));
        let mut right = left.clone();
        right.state.index = 1;
        right.utxo.vout = 2;
        let state = confirmed(state.apply_outcome(Outcome::Expanded {
            batch: 0,
            expanded: vec![(root.utxo.outpoint(), vec![left.clone(), right.clone()])],
            txids: vec![txid(0xe1)],
        }));
        assert_eq!(
            state.next_action(&deposits, &withdrawals),
            Some(Action::Distribute {
                batch: 0,
                nodes: vec![left.clone(), right.clone()]
            })
        );

        let state = state.apply_outcome(Outcome::Distributed {
            batch: 0,
            spent: vec![left.utxo.outpoint(), right.utxo.outpoint()],
            txids: vec![txid(0xd0), txid(0xd1)],
        });
        assert_eq!(
            state.withdrawal_batches[0],
            WithdrawalBatch::Distributed {
                count: 5,
                total: 675
            }
        );
    }

    #[test]
    fn test_zero_amount_withdrawals_dropped() {
        let real: Vec<_> = [400, 300, 200, 100]
            .iter()
            .map(|amount| Withdrawal::new(&random_p2tr_script(), *amount).unwrap())
            .collect();
        let mut closed = vec![Withdrawal::new(&random_p2tr_script(), 0).unwrap(); 4];
        closed.extend(real.iter().cloned());

        let state = OperatorState::default().apply(&Event::WithdrawalBatchClosed {
            withdrawals: closed,
        });
        assert_eq!(
            state.withdrawal_batches,
            vec![WithdrawalBatch::Pending { withdrawals: real }]
        );

        let state = state.apply(&Event::WithdrawalBatchClosed {
            withdrawals: vec![Withdrawal::placeholder(); 2],
        });
        assert_eq!(state.withdrawal_batches.len(), 1);
    }

    #[test]
    fn test_failed_bridge_action_is_deferred() {
        let (deposits, withdrawals) = policies(2);
        let closed = vec![Withdrawal::new(&random_p2tr_script(), 50_000).unwrap()];
        let state = confirmed(OperatorState::new(bridge(0xbb)))
            .apply(&Event::WithdrawalBatchClosed {
                withdrawals: closed.clone(),
            })
            .apply(&Event::WithdrawalBatchClosed { withdrawals: closed });

        let failed = Action::CreateWithdrawal { batch: 0 };
        let state = state.apply_outcome(Outcome::Failed {
            action: failed.clone(),
            reason: "insufficient funds".to_string(),
        });
        assert_eq!(
            state.next_action(&deposits, &withdrawals),
            Some(Action::CreateWithdrawal { batch: 1 })
        );

        let state = state.apply_outcome(Outcome::Failed {
            action: Action::CreateWithdrawal { batch: 1 },
            reason: "insufficient funds".to_string(),
        });
        assert_eq!(state.next_action(&deposits, &withdrawals), None);

        // other work still proceeds
        let state = confirmed(observe(state, &[1, 2], 0));
        assert!(matches!(
            state.next_action(&deposits, &withdrawals),
            Some(Action::OpenDepositBatch { .. })
        ));

        let state = state.apply(&Event::NewBlock { height: 1, time: 1 });
        assert!(state.deferred.is_empty());
        assert_eq!(state.next_action(&deposits, &withdrawals), Some(failed));
    }

    #[test]
    fn test_event_json() {
        let event = Event::TxConfirmed { txid: txid(7) };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(serde_json::from_str::<Event>(&json).unwrap(), event);
    }
}
