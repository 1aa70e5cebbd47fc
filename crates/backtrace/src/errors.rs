//! Errors raised while tracing a covenant output back through the chain.

use bitcoin::{OutPoint, Txid};
use catbridge_btcio::ClientError;
use catbridge_covenants::CovenantError;
use catbridge_merkle::MerkleError;
use thiserror::Error;

/// A covenant output whose history does not check out against the chain.
#[derive(Debug, Error)]
pub enum BacktraceError {
    /// The transaction rebuilt from raw chain data does not hash to the id it was fetched by.
    ///
    /// The offchain view and the chain have diverged; nothing built on it may be spent.
    #[error("provenance mismatch: expected {expected}, rebuilt {got}")]
    ProvenanceMismatch {
        /// The txid the output claims.
        expected: Txid,

        /// The id recomputed from the fetched transaction.
        got: Txid,
    },

    /// The output is not the one claimed.
    #[error("output {0} does not match the claimed script or value")]
    OutputMismatch(OutPoint),

    /// The state hash committed by the creating transaction is not the claimed state.
    #[error("state mismatch at {outpoint}: {what}")]
    StateMismatch {
        /// The covenant output.
        outpoint: OutPoint,

        /// What disagreed.
        what: &'static str,
    },

    /// An aggregator node does not spend the outputs holding its children.
    #[error("ancestor mismatch at {0}")]
    AncestorMismatch(OutPoint),

    /// The chain could not be queried.
    #[error("chain: {0}")]
    Client(#[from] ClientError),

    /// A fetched transaction is not a well-formed covenant transaction.
    #[error("covenant: {0}")]
    Covenant(#[from] CovenantError),

    /// A claimed state could not be hashed.
    #[error("merkle: {0}")]
    Merkle(#[from] MerkleError),
}

/// Result type alias that has [`BacktraceError`] as the error type.
pub type BacktraceResult<T> = Result<T, BacktraceError>;
