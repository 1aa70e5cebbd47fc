//! Errors raised while building or updating the trees.

use catbridge_primitives::errors::PrimitivesError;
use thiserror::Error;

/// Errors raised while building or updating one of the bridge trees.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MerkleError {
    /// No elements present in the tree.
    #[error("no elements present in tree")]
    NoElements,

    /// The leaf count must be a power of two.
    #[error("leaf count {0} is not a power of two")]
    NotPowerOfTwo(usize),

    /// Index provided exceeds the bounds.
    #[error("index {0} exceeds the bounds")]
    IndexOutOfBounds(usize),

    /// The tree would exceed its maximum height.
    #[error("tree height {got} exceeds maximum {max}")]
    TooDeep {
        /// The height that would have been produced.
        got: u8,

        /// The maximum allowed height.
        max: u8,
    },

    /// A proof did not authenticate the claimed leaf against the root.
    #[error("merkle proof does not match root")]
    ProofMismatch,

    /// A proof has the wrong number of nodes.
    #[error("merkle proof has {0} nodes")]
    ProofLength(usize),

    /// A withdrawal destination is not a 34-byte P2TR script.
    #[error("withdrawal script must be 34 bytes, got {0}")]
    InvalidWithdrawalScript(usize),

    /// Child amounts do not sum to a representable total.
    #[error("amount overflow: {0} + {1}")]
    AmountOverflow(u64, u64),

    /// A node did not have the shape expected for its level.
    #[error("malformed node: {0}")]
    MalformedNode(&'static str),

    /// An amount could not be encoded.
    #[error("amount: {0}")]
    Amount(#[from] PrimitivesError),
}

/// Result alias with [`MerkleError`] as the error type.
pub type MerkleResult<T> = Result<T, MerkleError>;
