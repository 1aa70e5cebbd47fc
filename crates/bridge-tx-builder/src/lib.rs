//! Build covenant transactions.
//!
//! Wraps [`bitcoin`] transaction construction with the layout every covenant method expects: the
//! covenant inputs first, then fee inputs; the state commitment first, then contract outputs, then
//! change. Provides fee estimation against full-size dummy witnesses and the preimage grinding
//! that makes covenant inputs unlockable.

pub mod builder;
pub mod constants;
pub mod errors;
pub mod operations;

pub mod prelude {
    //! Re-exports of the items needed to assemble a covenant transaction.

    pub use crate::{
        builder::{CovenantTxBuilder, CovenantTxDraft, TxSigningData},
        errors::{TxBuilderError, TxBuilderResult},
        operations::{calldata_len, key_spend_address},
    };
}
