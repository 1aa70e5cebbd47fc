//! Errors during parsing/handling/conversion of primitives.

use thiserror::Error;

/// Errors that can occur while encoding or parsing bridge primitives.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PrimitivesError {
    /// The amount cannot be represented as a script number.
    #[error("amount {0} outside the script-safe range [0, 0x7fffffff]")]
    AmountOutOfRange(u64),

    /// A fixed-size field had the wrong length.
    #[error("invalid length: expected {expected}, got {got}")]
    InvalidLength {
        /// The expected length in bytes.
        expected: usize,

        /// The actual length in bytes.
        got: usize,
    },

    /// Invalid hex string.
    #[error("invalid hex: {0}")]
    Hex(String),
}

/// Result alias with [`PrimitivesError`] as the error type.
pub type PrimitivesResult<T> = Result<T, PrimitivesError>;
