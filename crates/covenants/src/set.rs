//! Derivation of the full covenant set from an operator key.

use bitcoin::{secp256k1::XOnlyPublicKey, Address, Network, Transaction, TxOut};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    bridge::Bridge,
    covenant::Covenant,
    deposit_aggregator::DepositAggregator,
    errors::{CovenantError, CovenantResult},
    withdrawal_expander::WithdrawalExpander,
};

/// The three covenants of one operator.
#[derive(Debug, Clone)]
pub struct CovenantSet {
    /// The bridge.
    pub bridge: Bridge,

    /// The deposit aggregator, finalizing into [`Self::bridge`].
    pub deposit_aggregator: DepositAggregator,

    /// The withdrawal expander, funded by [`Self::bridge`].
    pub withdrawal_expander: WithdrawalExpander,
}

/// Covenant addresses as strings, as found in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CovenantAddresses {
    /// The bridge address.
    pub bridge: String,

    /// The deposit aggregator address.
    pub deposit_aggregator: String,

    /// The withdrawal expander address.
    pub withdrawal_expander: String,
}

impl CovenantSet {
    /// Derives the covenants of `operator`.
    ///
    /// Derivation is deterministic: the expander depends on the operator only, the bridge on the
    /// expander, and the aggregator on the bridge.
    pub fn derive(operator: &XOnlyPublicKey, network: Network) -> CovenantResult<Self> {
        let withdrawal_expander = WithdrawalExpander::new(operator, network)?;
        let bridge = Bridge::new(operator, &withdrawal_expander, network)?;
        let deposit_aggregator = DepositAggregator::new(operator, &bridge, network)?;

        Ok(Self {
            bridge,
            deposit_aggregator,
            withdrawal_expander,
        })
    }

    /// The derived addresses.
    pub fn addresses(&self) -> CovenantAddresses {
        CovenantAddresses {
            bridge: self.bridge.script().address().to_string(),
            deposit_aggregator: self.deposit_aggregator.script().address().to_string(),
            withdrawal_expander: self.withdrawal_expander.script().address().to_string(),
        }
    }

    /// Compares the derived addresses against `expected`.
    pub fn check_addresses(&self, expected: &CovenantAddresses) -> CovenantResult<()> {
        let pairs: [(&'static str, &Address, &str); 3] = [
            ("bridge", self.bridge.script().address(), &expected.bridge),
            (
                "deposit aggregator",
                self.deposit_aggregator.script().address(),
                &expected.deposit_aggregator,
            ),
            (
                "withdrawal expander",
                self.withdrawal_expander.script().address(),
                &expected.withdrawal_expander,
            ),
        ];

        for (covenant, derived, expected) in pairs {
            if derived.to_string() != expected {
                return Err(CovenantError::AddressMismatch {
                    covenant,
                    derived: derived.to_string(),
                    expected: expected.to_string(),
                });
            }
        }

        info!("covenant addresses match configuration");
        Ok(())
    }

    /// Verifies input `input_index` of `tx` against the covenant locking the output it spends.
    ///
    /// Returns the name of the covenant whose call was accepted.
    pub fn verify_input(
        &self,
        tx: &Transaction,
        prevouts: &[TxOut],
        input_index: usize,
    ) -> CovenantResult<&'static str> {
        let spent = prevouts
            .get(input_index)
            .ok_or(CovenantError::PrevoutsMismatch)?;

        let name = if spent.script_pubkey == self.bridge.script_pubkey() {
            self.bridge.verify(tx, prevouts, input_index)?;
            Bridge::NAME
        } else if spent.script_pubkey == self.deposit_aggregator.script_pubkey() {
            self.deposit_aggregator.verify(tx, prevouts, input_index)?;
            DepositAggregator::NAME
        } else if spent.script_pubkey == self.withdrawal_expander.script_pubkey() {
            self.withdrawal_expander.verify(tx, prevouts, input_index)?;
            WithdrawalExpander::NAME
        } else {
            return Err(CovenantError::ScriptMismatch("spent output is not a covenant"));
        };

        debug!(covenant = name, input = input_index, "covenant input verified");
        Ok(name)
    }
}
