//! Merkle structures used by the bridge covenants.
//!
//! Three trees with different semantics live here:
//!
//! - [`batch::BatchTree`]: the fixed 16-slot tree of finalized deposit batch ids held by the
//!   bridge, updated one slot at a time through [`batch::MerkleProof`]s.
//! - [`aggregation`]: the bottom-up binary tree deposits are merged into.
//! - [`expansion`]: the top-down binary tree a withdrawal batch is split along.
//!
//! The aggregation and expansion hashes are prefixed with the node level so that a hash from one
//! level can never be passed off as a node of another.

pub mod aggregation;
pub mod batch;
pub mod error;
pub mod expansion;

pub use error::{MerkleError, MerkleResult};
