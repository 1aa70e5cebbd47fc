//! The withdrawal expansion tree.
//!
//! A withdrawal batch is committed as a single root. Each internal node commits both child hashes
//! and both child amounts so that an `expand` step can check the split conserves value without
//! revealing anything below the children.

use bitcoin::ScriptBuf;
use borsh::{BorshDeserialize, BorshSerialize};
use catbridge_primitives::{
    amount::{encode_amount, encode_level},
    buf::Buf32,
    constants::{MAX_EXPANSION_LEVEL, P2TR_SCRIPT_SIZE},
    hash::sha256_concat,
};
use serde::{Deserialize, Serialize};

use crate::error::{MerkleError, MerkleResult};

/// A single payout: the destination script and the amount in sats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct Withdrawal {
    address_script: Vec<u8>,
    amount: u64,
}

impl Withdrawal {
    /// Creates a withdrawal paying `amount` to a P2TR `script`.
    pub fn new(script: &ScriptBuf, amount: u64) -> MerkleResult<Self> {
        if script.len() != P2TR_SCRIPT_SIZE {
            return Err(MerkleError::InvalidWithdrawalScript(script.len()));
        }
        Ok(Self {
            address_script: script.to_bytes(),
            amount,
        })
    }

    /// The zero-amount leaf used to pad a batch to a power of two.
    pub fn placeholder() -> Self {
        Self {
            address_script: vec![0; P2TR_SCRIPT_SIZE],
            amount: 0,
        }
    }

    /// Returns `true` for padding leaves, which produce no payout.
    pub fn is_placeholder(&self) -> bool {
        self.amount == 0
    }

    /// The destination script.
    pub fn script_pubkey(&self) -> ScriptBuf {
        ScriptBuf::from_bytes(self.address_script.clone())
    }

    /// The raw destination script bytes.
    pub fn address_script(&self) -> &[u8] {
        &self.address_script
    }

    /// The withdrawn amount in sats.
    pub fn amount(&self) -> u64 {
        self.amount
    }

    /// `sha256(addressScript ‖ amount)`.
    pub fn hash(&self) -> MerkleResult<Buf32> {
        if self.address_script.len() != P2TR_SCRIPT_SIZE {
            return Err(MerkleError::InvalidWithdrawalScript(
                self.address_script.len(),
            ));
        }
        let amt = encode_amount(self.amount)?;
        Ok(sha256_concat(&[&self.address_script, &amt]))
    }
}

/// Hash of a level-0 expansion node.
pub fn hash_withdrawal_leaf(withdrawal: &Withdrawal) -> MerkleResult<Buf32> {
    let inner = withdrawal.hash()?;
    Ok(sha256_concat(&[&encode_level(0), inner.as_ref()]))
}

/// Hash of an expansion node at `level > 0`.
pub fn hash_expansion_node(
    level: u8,
    left_amt: u64,
    left_hash: &Buf32,
    right_amt: u64,
    right_hash: &Buf32,
) -> MerkleResult<Buf32> {
    Ok(sha256_concat(&[
        &encode_level(level),
        &encode_amount(left_amt)?,
        left_hash.as_ref(),
        &encode_amount(right_amt)?,
        right_hash.as_ref(),
    ]))
}

/// One node of the expansion tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub enum ExpansionNode {
    /// A single payout at level 0.
    Leaf(Withdrawal),

    /// A split into two subtrees one level down.
    Internal {
        /// Level of this node, at least 1.
        level: u8,

        /// Total amount under the left child.
        left_amt: u64,

        /// Hash of the left child.
        left_hash: Buf32,

        /// Total amount under the right child.
        right_amt: u64,

        /// Hash of the right child.
        right_hash: Buf32,
    },
}

impl ExpansionNode {
    /// Joins two children at the same level into their parent.
    pub fn join(left: &ExpansionNode, right: &ExpansionNode) -> MerkleResult<Self> {
        if left.level() != right.level() {
            return Err(MerkleError::MalformedNode("children on different levels"));
        }

        let level = left.level() + 1;
        if level > MAX_EXPANSION_LEVEL {
            return Err(MerkleError::TooDeep {
                got: level,
                max: MAX_EXPANSION_LEVEL,
            });
        }

        let node = Self::Internal {
            level,
            left_amt: left.amount()?,
            left_hash: left.hash()?,
            right_amt: right.amount()?,
            right_hash: right.hash()?,
        };
        node.amount()?;
        Ok(node)
    }

    /// The level of this node.
    pub fn level(&self) -> u8 {
        match self {
            Self::Leaf(_) => 0,
            Self::Internal { level, .. } => *level,
        }
    }

    /// Total amount committed under this node.
    pub fn amount(&self) -> MerkleResult<u64> {
        match self {
            Self::Leaf(w) => Ok(w.amount()),
            Self::Internal {
                left_amt,
                right_amt,
                ..
            } => left_amt
                .checked_add(*right_amt)
                .ok_or(MerkleError::AmountOverflow(*left_amt, *right_amt)),
        }
    }

    /// The level-separated hash this node commits to.
    pub fn hash(&self) -> MerkleResult<Buf32> {
        match self {
            Self::Leaf(w) => hash_withdrawal_leaf(w),
            Self::Internal {
                level,
                left_amt,
                left_hash,
                right_amt,
                right_hash,
            } => {
                if *level == 0 {
                    return Err(MerkleError::MalformedNode("internal node at level 0"));
                }
                self.amount()?;
                hash_expansion_node(*level, *left_amt, left_hash, *right_amt, right_hash)
            }
        }
    }
}

/// A complete expansion tree over a withdrawal batch padded to a power of two.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpansionTree {
    /// `levels[0]` holds the leaves, the last entry holds the root.
    levels: Vec<Vec<ExpansionNode>>,
}

impl ExpansionTree {
    /// Builds the tree from `withdrawals`, padding with placeholders.
    pub fn build(withdrawals: &[Withdrawal]) -> MerkleResult<Self> {
        if withdrawals.is_empty() {
            return Err(MerkleError::NoElements);
        }

        let size = withdrawals.len().next_power_of_two();
        let height = size.trailing_zeros() as u8;
        if height > MAX_EXPANSION_LEVEL {
            return Err(MerkleError::TooDeep {
                got: height,
                max: MAX_EXPANSION_LEVEL,
            });
        }

        let mut leaves: Vec<_> = withdrawals
            .iter()
            .cloned()
            .map(ExpansionNode::Leaf)
            .collect();
        leaves.resize(size, ExpansionNode::Leaf(Withdrawal::placeholder()));

        let mut levels = vec![leaves];
        while let Some(last) = levels.last() {
            if last.len() == 1 {
                break;
            }
            let next = last
                .chunks(2)
                .map(|pair| ExpansionNode::join(&pair[0], &pair[1]))
                .collect::<MerkleResult<Vec<_>>>()?;
            levels.push(next);
        }

        Ok(Self { levels })
    }

    /// Height of the tree.
    pub fn height(&self) -> u8 {
        (self.levels.len() - 1) as u8
    }

    /// The root node.
    pub fn root(&self) -> &ExpansionNode {
        &self.levels[self.levels.len() - 1][0]
    }

    /// Total amount of the batch.
    pub fn total(&self) -> MerkleResult<u64> {
        self.root().amount()
    }

    /// The node at `level`, counted from the left.
    pub fn node(&self, level: u8, index: usize) -> Option<&ExpansionNode> {
        self.levels.get(level as usize)?.get(index)
    }

    /// Locates a node by its hash.
    pub fn find(&self, hash: &Buf32) -> Option<(u8, usize)> {
        self.levels.iter().enumerate().find_map(|(level, nodes)| {
            nodes
                .iter()
                .position(|n| n.hash().ok().as_ref() == Some(hash))
                .map(|idx| (level as u8, idx))
        })
    }

    /// The two children of an internal node.
    pub fn children(&self, level: u8, index: usize) -> Option<(&ExpansionNode, &ExpansionNode)> {
        if level == 0 {
            return None;
        }
        let below = self.levels.get(level as usize - 1)?;
        Some((below.get(2 * index)?, below.get(2 * index + 1)?))
    }

    /// The leaves under a node, placeholders included.
    pub fn leaves_under(&self, level: u8, index: usize) -> Vec<Withdrawal> {
        let width = 1usize << level;
        self.levels[0]
            .iter()
            .skip(index * width)
            .take(width)
            .filter_map(|n| match n {
                ExpansionNode::Leaf(w) => Some(w.clone()),
                ExpansionNode::Internal { .. } => None,
            })
            .collect()
    }
}

/// Rebuilds the subtree hash over exactly `2^level` leaves, as `distribute` checks it.
pub fn subtree_root(leaves: &[Withdrawal]) -> MerkleResult<ExpansionNode> {
    if !leaves.len().is_power_of_two() {
        return Err(MerkleError::NotPowerOfTwo(leaves.len()));
    }
    let tree = ExpansionTree::build(leaves)?;
    Ok(tree.root().clone())
}
