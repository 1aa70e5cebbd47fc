//! The deposit aggregation tree, built bottom-up by pairwise merging.

use borsh::{BorshDeserialize, BorshSerialize};
use catbridge_primitives::{
    amount::{encode_amount, encode_level},
    buf::Buf32,
    constants::MAX_AGGREGATION_LEVEL,
    hash::{sha256, sha256_concat},
};
use serde::{Deserialize, Serialize};

use crate::error::{MerkleError, MerkleResult};

/// A single deposit: the L2 account to credit and the amount in sats.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize,
)]
pub struct DepositData {
    /// The 32-byte L2 account address.
    pub address: Buf32,

    /// The deposited amount in sats.
    pub amount: u64,
}

impl DepositData {
    /// Creates new deposit data.
    pub fn new(address: Buf32, amount: u64) -> Self {
        Self { address, amount }
    }

    /// `sha256(address ‖ amount)`.
    pub fn hash(&self) -> MerkleResult<Buf32> {
        let amt = encode_amount(self.amount)?;
        Ok(sha256_concat(&[self.address.as_ref(), &amt]))
    }
}

/// Hash of a level-0 aggregation node.
pub fn hash_deposit_leaf(data: &DepositData) -> MerkleResult<Buf32> {
    let inner = data.hash()?;
    Ok(sha256_concat(&[&encode_level(0), inner.as_ref()]))
}

/// Hash of an aggregation node at `level > 0` over its two children.
pub fn hash_aggregation_node(level: u8, hash0: &Buf32, hash1: &Buf32) -> Buf32 {
    sha256_concat(&[&encode_level(level), hash0.as_ref(), hash1.as_ref()])
}

/// One node of the aggregation tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub enum AggregationNode {
    /// A single deposit at level 0.
    Leaf(DepositData),

    /// The merge of two nodes at `level - 1`.
    Internal {
        /// Level of this node, at least 1.
        level: u8,

        /// Hash of the first child.
        prev_hash_data0: Buf32,

        /// Hash of the second child.
        prev_hash_data1: Buf32,
    },
}

impl AggregationNode {
    /// Builds a leaf.
    pub fn leaf(address: Buf32, amount: u64) -> Self {
        Self::Leaf(DepositData::new(address, amount))
    }

    /// Merges two children at the same level into their parent.
    pub fn merge(left: &AggregationNode, right: &AggregationNode) -> MerkleResult<Self> {
        if left.level() != right.level() {
            return Err(MerkleError::MalformedNode("children on different levels"));
        }

        let level = left.level() + 1;
        if level > MAX_AGGREGATION_LEVEL {
            return Err(MerkleError::TooDeep {
                got: level,
                max: MAX_AGGREGATION_LEVEL,
            });
        }

        Ok(Self::Internal {
            level,
            prev_hash_data0: left.hash()?,
            prev_hash_data1: right.hash()?,
        })
    }

    /// The level of this node.
    pub fn level(&self) -> u8 {
        match self {
            Self::Leaf(_) => 0,
            Self::Internal { level, .. } => *level,
        }
    }

    /// Returns `true` for level-0 nodes.
    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf(_))
    }

    /// The level-separated hash this node commits to.
    pub fn hash(&self) -> MerkleResult<Buf32> {
        match self {
            Self::Leaf(data) => hash_deposit_leaf(data),
            Self::Internal {
                level,
                prev_hash_data0,
                prev_hash_data1,
            } => {
                if *level == 0 {
                    return Err(MerkleError::MalformedNode("internal node at level 0"));
                }
                Ok(hash_aggregation_node(
                    *level,
                    prev_hash_data0,
                    prev_hash_data1,
                ))
            }
        }
    }

    /// The child hashes of an internal node.
    pub fn child_hashes(&self) -> Option<(Buf32, Buf32)> {
        match self {
            Self::Leaf(_) => None,
            Self::Internal {
                prev_hash_data0,
                prev_hash_data1,
                ..
            } => Some((*prev_hash_data0, *prev_hash_data1)),
        }
    }
}

/// A complete aggregation tree over a power-of-two set of deposits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationTree {
    levels: Vec<Vec<AggregationNode>>,
}

impl AggregationTree {
    /// Builds the tree pairwise from `deposits`.
    pub fn build(deposits: &[DepositData]) -> MerkleResult<Self> {
        if deposits.is_empty() {
            return Err(MerkleError::NoElements);
        }
        if !deposits.len().is_power_of_two() {
            return Err(MerkleError::NotPowerOfTwo(deposits.len()));
        }

        let height = deposits.len().trailing_zeros() as u8;
        if height > MAX_AGGREGATION_LEVEL {
            return Err(MerkleError::TooDeep {
                got: height,
                max: MAX_AGGREGATION_LEVEL,
            });
        }

        let mut levels = vec![deposits
            .iter()
            .copied()
            .map(AggregationNode::Leaf)
            .collect::<Vec<_>>()];
        while let Some(last) = levels.last() {
            if last.len() == 1 {
                break;
            }
            let next = last
                .chunks(2)
                .map(|pair| AggregationNode::merge(&pair[0], &pair[1]))
                .collect::<MerkleResult<Vec<_>>>()?;
            levels.push(next);
        }

        Ok(Self { levels })
    }

    /// Height of the tree, i.e. `log2(leaf count)`.
    pub fn height(&self) -> u8 {
        (self.levels.len() - 1) as u8
    }

    /// Nodes at `level`.
    pub fn level(&self, level: u8) -> Option<&[AggregationNode]> {
        self.levels.get(level as usize).map(Vec::as_slice)
    }

    /// The root node.
    pub fn root(&self) -> &AggregationNode {
        &self.levels[self.levels.len() - 1][0]
    }
}
