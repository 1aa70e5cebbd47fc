//! The L1 covenants of the bridge.
//!
//! Three covenants enforce the bridge protocol on chain:
//!
//! - [`bridge::Bridge`] holds finalized deposits and the batch tree.
//! - [`deposit_aggregator::DepositAggregator`] merges deposits pairwise into a batch.
//! - [`withdrawal_expander::WithdrawalExpander`] splits a withdrawal batch down to its payouts.
//!
//! Each covenant method is evaluated by [`covenant::Covenant::check_call`] against the
//! [`preimage::SHPreimage`] of the input being unlocked, the same view its script has of the
//! spending transaction. [`covenant::Covenant::unlock`] then produces the witness, and
//! [`covenant::Covenant::verify`] re-runs the check on a finished spend.
// Only depended on to enable its `global-context` feature for `bitcoin::secp256k1`.
use secp256k1 as _;


pub mod bridge;
pub mod covenant;
pub mod deposit_aggregator;
pub mod errors;
pub mod preimage;
pub mod scripts;
pub mod set;
pub mod tx;
pub mod withdrawal_expander;

/// The typed states committed by covenant outputs.
pub mod state {
    pub use catbridge_merkle::{
        aggregation::{AggregationNode, DepositData},
        expansion::{ExpansionNode, Withdrawal},
    };

    pub use crate::bridge::BridgeState;
}

#[cfg(test)]
mod test_utils;

pub use covenant::{Covenant, SpendContext};
pub use errors::{CovenantError, CovenantResult};
pub use set::{CovenantAddresses, CovenantSet};
