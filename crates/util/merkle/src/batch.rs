//! The bridge batch tree: a fixed-depth binary Merkle tree over [`BATCH_TREE_SIZE`] batch ids.

use borsh::{BorshDeserialize, BorshSerialize};
use catbridge_primitives::{
    buf::Buf32,
    constants::{BATCH_TREE_DEPTH, BATCH_TREE_SIZE, EMPTY_BATCH_ID},
    hash::sha256_concat,
};
use serde::{Deserialize, Serialize};

use crate::error::{MerkleError, MerkleResult};

/// Hashes two sibling nodes into their parent.
pub fn hash_node(left: &Buf32, right: &Buf32) -> Buf32 {
    sha256_concat(&[left.as_ref(), right.as_ref()])
}

/// Which side of its parent a proof node sits on.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize,
)]
pub enum NodePosition {
    /// The sibling is the left child; the running hash goes on the right.
    Left,

    /// The sibling is the right child; the running hash goes on the left.
    Right,
}

/// A sibling hash on the path from a leaf to the root.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize,
)]
pub struct ProofNode {
    /// The sibling hash.
    pub hash: Buf32,

    /// The side the sibling occupies.
    pub position: NodePosition,
}

/// An inclusion proof for one slot of the batch tree, ordered leaf to root.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize,
)]
pub struct MerkleProof {
    nodes: Vec<ProofNode>,
}

impl MerkleProof {
    /// Creates a proof from its nodes, which must cover exactly [`BATCH_TREE_DEPTH`] levels.
    pub fn new(nodes: Vec<ProofNode>) -> MerkleResult<Self> {
        if nodes.len() != BATCH_TREE_DEPTH {
            return Err(MerkleError::ProofLength(nodes.len()));
        }
        Ok(Self { nodes })
    }

    /// The proof nodes, leaf to root.
    pub fn nodes(&self) -> &[ProofNode] {
        &self.nodes
    }

    /// The slot index this proof is for.
    pub fn leaf_index(&self) -> usize {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.position == NodePosition::Left)
            .fold(0, |acc, (level, _)| acc | (1 << level))
    }

    /// Folds `leaf` up the proof path.
    pub fn compute_root(&self, leaf: &Buf32) -> Buf32 {
        self.nodes.iter().fold(*leaf, |acc, node| match node.position {
            NodePosition::Left => hash_node(&node.hash, &acc),
            NodePosition::Right => hash_node(&acc, &node.hash),
        })
    }

    /// Checks that `leaf` sits at this proof's slot under `root`.
    pub fn verify(&self, leaf: &Buf32, root: &Buf32) -> bool {
        self.nodes.len() == BATCH_TREE_DEPTH && self.compute_root(leaf) == *root
    }

    /// Verifies `old_leaf` against `old_root` and returns the root after replacing it with
    /// `new_leaf`.
    pub fn update_root(
        &self,
        old_leaf: &Buf32,
        new_leaf: &Buf32,
        old_root: &Buf32,
    ) -> MerkleResult<Buf32> {
        if !self.verify(old_leaf, old_root) {
            return Err(MerkleError::ProofMismatch);
        }
        Ok(self.compute_root(new_leaf))
    }
}

/// The 16 batch-id slots held by the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchTree {
    leaves: Vec<Buf32>,
}

impl Default for BatchTree {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchTree {
    /// A tree with every slot empty.
    pub fn new() -> Self {
        Self {
            leaves: vec![EMPTY_BATCH_ID; BATCH_TREE_SIZE],
        }
    }

    /// Builds a tree from exactly [`BATCH_TREE_SIZE`] leaves.
    pub fn from_leaves(leaves: Vec<Buf32>) -> MerkleResult<Self> {
        if leaves.len() != BATCH_TREE_SIZE {
            return Err(MerkleError::IndexOutOfBounds(leaves.len()));
        }
        Ok(Self { leaves })
    }

    /// The slots.
    pub fn leaves(&self) -> &[Buf32] {
        &self.leaves
    }

    /// The leaf at `index`.
    pub fn get(&self, index: usize) -> Option<&Buf32> {
        self.leaves.get(index)
    }

    /// Every level of the tree, leaves first and root last.
    fn layers(&self) -> Vec<Vec<Buf32>> {
        let mut layers = vec![self.leaves.clone()];
        while let Some(last) = layers.last() {
            if last.len() == 1 {
                break;
            }
            let next = last
                .chunks(2)
                .map(|pair| hash_node(&pair[0], &pair[1]))
                .collect();
            layers.push(next);
        }
        layers
    }

    /// Recomputes the root from all slots.
    pub fn root(&self) -> Buf32 {
        self.layers()
            .last()
            .and_then(|top| top.first().copied())
            .unwrap_or(EMPTY_BATCH_ID)
    }

    /// The inclusion proof of the slot at `index`.
    pub fn proof(&self, index: usize) -> MerkleResult<MerkleProof> {
        if index >= BATCH_TREE_SIZE {
            return Err(MerkleError::IndexOutOfBounds(index));
        }

        let layers = self.layers();
        let mut nodes = Vec::with_capacity(BATCH_TREE_DEPTH);
        let mut idx = index;
        for layer in layers.iter().take(BATCH_TREE_DEPTH) {
            let (sibling, position) = if idx % 2 == 0 {
                (layer[idx + 1], NodePosition::Right)
            } else {
                (layer[idx - 1], NodePosition::Left)
            };
            nodes.push(ProofNode {
                hash: sibling,
                position,
            });
            idx /= 2;
        }

        MerkleProof::new(nodes)
    }

    /// The first slot holding [`EMPTY_BATCH_ID`].
    pub fn first_empty_slot(&self) -> Option<usize> {
        self.position_of(&EMPTY_BATCH_ID)
    }

    /// The slot holding `batch_id`, if any.
    pub fn position_of(&self, batch_id: &Buf32) -> Option<usize> {
        self.leaves.iter().position(|leaf| leaf == batch_id)
    }

    /// Replaces the slot at `index` and returns the new root.
    pub fn replace(&mut self, index: usize, leaf: Buf32) -> MerkleResult<Buf32> {
        let slot = self
            .leaves
            .get_mut(index)
            .ok_or(MerkleError::IndexOutOfBounds(index))?;
        *slot = leaf;
        Ok(self.root())
    }
}
