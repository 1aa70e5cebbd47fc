//! Defines the error types raised by the bridge workflows.

use bitcoin::Amount;
use catbridge_backtrace::BacktraceError;
use catbridge_btcio::{BroadcastFailure, ClientError};
use catbridge_covenants::CovenantError;
use catbridge_merkle::MerkleError;
use catbridge_tx_builder::prelude::TxBuilderError;
use thiserror::Error;

/// Error during execution of a workflow.
///
/// Every error halts the workflow step it was raised in. None of them is retried automatically:
/// the next step is derived again from the chain.
#[derive(Error, Debug)]
pub enum ExecError {
    /// A bridge invariant does not hold; raised before anything is broadcast.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The fee wallet cannot cover a transaction.
    #[error("insufficient funds: need {needed}, have {available}")]
    InsufficientFunds {
        /// Outputs plus fee.
        needed: Amount,

        /// Value of the selected inputs.
        available: Amount,
    },

    /// A covenant output does not check out against the chain.
    #[error("backtrace failed: {0}")]
    Backtrace(#[from] BacktraceError),

    /// No bindable preimage was found within the grinding bound.
    #[error("no bindable preimage after {0} attempts")]
    PreimageGrindExhausted(u32),

    /// A batch broadcast stopped part way; its prefix is on chain.
    #[error("{0}")]
    BroadcastFailure(#[from] BroadcastFailure),

    /// Error assembling a transaction.
    #[error("could not build transaction: {0}")]
    TxBuilder(TxBuilderError),

    /// Error evaluating a covenant.
    #[error("covenant: {0}")]
    Covenant(#[from] CovenantError),

    /// Error building a tree.
    #[error("merkle: {0}")]
    Merkle(#[from] MerkleError),

    /// Error communicating with the chain, the fee wallet or the signer.
    #[error("bitcoin client: {0}")]
    Client(#[from] ClientError),
}

impl From<TxBuilderError> for ExecError {
    fn from(value: TxBuilderError) -> Self {
        match value {
            TxBuilderError::InsufficientFunds { needed, available } => {
                Self::InsufficientFunds { needed, available }
            }
            TxBuilderError::NoValidPreimageFound(attempts) => Self::PreimageGrindExhausted(attempts),
            TxBuilderError::Covenant(e) => Self::Covenant(e),
            other => Self::TxBuilder(other),
        }
    }
}

/// Result of a workflow that may produce an [`ExecError`].
pub type ExecResult<T> = Result<T, ExecError>;
