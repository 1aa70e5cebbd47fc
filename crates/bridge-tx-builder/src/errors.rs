//! Enumerated errors related to assembling covenant transactions.

use bitcoin::Amount;
use catbridge_covenants::CovenantError;
use thiserror::Error;

/// Error during building of covenant transactions.
#[derive(Debug, Error)]
pub enum TxBuilderError {
    /// The inputs do not cover the outputs and the fee.
    #[error("insufficient funds: need {needed}, have {available}")]
    InsufficientFunds {
        /// Outputs plus fee.
        needed: Amount,

        /// Sum of all inputs.
        available: Amount,
    },

    /// More inputs than a covenant transaction may carry.
    #[error("too many inputs: {0} > {max}", max = crate::constants::MAX_INPUTS)]
    TooManyInputs(usize),

    /// More outputs than a covenant transaction may carry.
    #[error("too many outputs: {0} > {max}", max = crate::constants::MAX_OUTPUTS)]
    TooManyOutputs(usize),

    /// No sequence in the grinding range made every covenant input bindable.
    #[error("no valid preimage found after {0} attempts")]
    NoValidPreimageFound(u32),

    /// The draft has no inputs.
    #[error("transaction has no inputs")]
    NoInputs,

    /// The state commitment must be the first output.
    #[error("state output must come first")]
    StateOutputNotFirst,

    /// The referenced input is not a covenant input.
    #[error("input {0} is not a covenant input")]
    NotCovenantInput(usize),

    /// A covenant input is locked by a different script than the covenant being spent.
    #[error("input {0} is not locked by its covenant")]
    ScriptMismatch(usize),

    /// The fee computation overflowed.
    #[error("fee overflow at {vsize} vbytes")]
    FeeOverflow {
        /// Estimated virtual size.
        vsize: usize,
    },

    /// A covenant call could not be encoded.
    #[error("could not encode calldata: {0}")]
    Encoding(String),

    /// Error evaluating a covenant.
    #[error("covenant: {0}")]
    Covenant(#[from] CovenantError),
}

/// Result type alias that has [`TxBuilderError`] as the error type for succinctness.
pub type TxBuilderResult<T> = Result<T, TxBuilderError>;
