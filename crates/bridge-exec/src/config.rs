//! Defines the configuration parameters for the bridge operator that need to supplied externally
//! by the user running it.

use core::time;
use std::{
    fs, io,
    path::{Path, PathBuf},
};

use bitcoin::{FeeRate, Network};
use catbridge_covenants::CovenantAddresses;
use format_serde_error::SerdeError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::{DepositPolicy, WithdrawalPolicy};

/// The configuration for the bridge operator that is supplied by the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The network the covenants are derived for.
    pub network: Network,

    /// The `bitcoind` instance used as chain provider and fee wallet.
    pub bitcoind: BitcoindConfig,

    /// The path to private data required for authorization.
    pub secrets: SecretsConfig,

    /// Parameters of the covenant transactions.
    pub tx: TxConfig,

    /// When deposits are batched.
    pub deposit: DepositPolicy,

    /// How withdrawal batches are paid out.
    pub withdrawal: WithdrawalPolicy,

    /// The frequency with which the operator queries the full node.
    pub poll_interval: time::Duration,

    /// Covenant addresses the operator key is expected to derive.
    ///
    /// Checked at startup when set.
    #[serde(default)]
    pub covenants: Option<CovenantAddresses>,
}

/// The RPC endpoint of `bitcoind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitcoindConfig {
    /// The RPC URL.
    pub url: String,

    /// The RPC user.
    pub user: String,

    /// The RPC password.
    pub password: String,
}

/// The details required for authorization activities (such as signing).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    /// The path to the file that contains the hex-encoded operator secret key.
    pub operator_key: PathBuf,
}

/// Parameters of the covenant transactions the operator builds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxConfig {
    /// Fee rate in sat/vB.
    pub fee_rate: u64,

    /// Amount held by a freshly deployed bridge, in sats.
    pub bridge_genesis_amount: u64,

    /// Confirmations a covenant output needs before it is spent.
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
}

fn default_confirmations() -> u64 {
    1
}

impl TxConfig {
    /// The configured fee rate.
    pub fn fee_rate(&self) -> InitResult<FeeRate> {
        FeeRate::from_sat_per_vb(self.fee_rate)
            .ok_or_else(|| InitError::Invalid(format!("fee rate {} sat/vB", self.fee_rate)))
    }
}

impl Config {
    /// Parse the config at the given path and produce the [`Config`].
    pub fn load_from_path(path: impl AsRef<Path>) -> InitResult<Self> {
        let contents = fs::read_to_string(path)?;
        let config = toml::from_str::<Config>(contents.as_str())
            .map_err(|e| SerdeError::new(contents, (Box::new(e) as Box<dyn std::error::Error>, None, None)))?;

        config.validate()?;
        Ok(config)
    }

    /// Checks the values serde cannot.
    pub fn validate(&self) -> InitResult<()> {
        self.tx.fee_rate()?;
        self.deposit.validate().map_err(InitError::Invalid)?;
        self.withdrawal.validate().map_err(InitError::Invalid)?;
        Ok(())
    }
}

/// Error during initialization.
#[derive(Debug, Error)]
pub enum InitError {
    /// I/O related error while reading config.
    #[error("error loading config file: {0}")]
    Io(#[from] io::Error),

    /// Error while parsing the provided config.
    #[error("invalid config data: {0}")]
    MalformedConfig(#[from] SerdeError),

    /// A value parsed but is out of range.
    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Result of parsing the config file which may produce an [`InitError`].
pub type InitResult<T> = Result<T, InitError>;
