//! Errors raised while deriving, evaluating or unlocking covenants.

use bitcoin::taproot::{TaprootBuilder, TaprootBuilderError};
use catbridge_merkle::MerkleError;
use catbridge_primitives::errors::PrimitivesError;
use thiserror::Error;

/// A violated covenant rule or a failure to build covenant scripts.
///
/// Every rule violation is terminal for the spend being attempted: the equivalent script would
/// fail to evaluate and the transaction would be rejected by the chain.
#[derive(Debug, Error)]
pub enum CovenantError {
    /// A transition precondition does not hold.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The preimage fields do not hash to the challenge carried alongside them.
    #[error("sighash preimage does not match its challenge")]
    PreimageMismatch,

    /// The challenge's last byte is too large to be incremented inside the script.
    #[error("challenge suffix {0} is not below 127")]
    PreimageUnbindable(u8),

    /// The operator signature is missing or invalid.
    #[error("invalid operator signature")]
    OperatorSignature,

    /// The covenant is being unlocked at an input it does not support.
    #[error("covenant input expected at index {expected}, got {got}")]
    InputIndex {
        /// The index required by the method.
        expected: usize,

        /// The index of the input being unlocked.
        got: usize,
    },

    /// The outpoints rebuilt from the supplied previous transactions are not the ones spent.
    #[error("previous outpoints do not match the spending transaction")]
    PrevoutsMismatch,

    /// The outputs rebuilt from the transition are not the ones created.
    #[error("outputs do not match the expected transition")]
    OutputsMismatch,

    /// A previous transaction does not commit to the claimed state.
    #[error("state commitment mismatch: {0}")]
    StateMismatch(&'static str),

    /// An output is not locked by the expected covenant script.
    #[error("script mismatch: {0}")]
    ScriptMismatch(&'static str),

    /// Amounts are not conserved across the transition.
    #[error("amount not conserved: {0}")]
    Conservation(String),

    /// A witness does not have the covenant layout.
    #[error("malformed covenant witness: {0}")]
    MalformedWitness(String),

    /// The calldata needs more stack elements than the leaf script can drop.
    #[error("calldata of {0} bytes exceeds the covenant limit")]
    CalldataTooLarge(usize),

    /// A state commitment output could not be parsed.
    #[error("malformed state output: {0}")]
    MalformedState(String),

    /// Error while adding a leaf to a [`TaprootBuilder`].
    #[error("could not add leaf to the taproot tree")]
    CouldNotAddLeaf,

    /// Error while building the taproot output.
    #[error("could not build taproot address")]
    BuildFailed(#[from] TaprootBuilderError),

    /// The control block for the covenant leaf could not be computed.
    #[error("control block generation failed")]
    ControlBlock,

    /// The derived covenant addresses differ from the expected ones.
    #[error("{covenant} address mismatch: derived {derived}, expected {expected}")]
    AddressMismatch {
        /// Name of the covenant.
        covenant: &'static str,

        /// The derived address.
        derived: String,

        /// The configured address.
        expected: String,
    },

    /// A tree operation failed.
    #[error("merkle: {0}")]
    Merkle(#[from] MerkleError),

    /// A primitive could not be encoded.
    #[error("primitives: {0}")]
    Primitives(#[from] PrimitivesError),
}

/// Result type alias that has [`CovenantError`] as the error type.
pub type CovenantResult<T> = Result<T, CovenantError>;

/// The unmodified [`TaprootBuilder`] is returned if a leaf could not be added to the taproot in the
/// call to [`TaprootBuilder::add_leaf`].
impl From<TaprootBuilder> for CovenantError {
    fn from(_value: TaprootBuilder) -> Self {
        CovenantError::CouldNotAddLeaf
    }
}
