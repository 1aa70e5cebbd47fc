//! Resolves the operator secret key.

use std::{fs::read_to_string, path::PathBuf};

use bitcoin::secp256k1::{Keypair, SecretKey, SECP256K1};
use catbridge_common::env::parse_env;
use tracing::*;

/// The environment variable that contains the hex-encoded operator [`SecretKey`].
pub(crate) const OPERATOR_KEY_ENVVAR: &str = "CATBRIDGE_OPERATOR_KEY";

/// Resolves the operator keypair.
///
/// Rules:
///
/// 1. A key in [`OPERATOR_KEY_ENVVAR`] wins over any path.
/// 2. Otherwise the path given on the command line is read.
/// 3. Otherwise the path from the config is read.
///
/// # Errors
///
/// Returns an error if the key file cannot be read or does not hold a valid key.
pub(crate) fn resolve_operator_key(
    cli_path: Option<PathBuf>,
    config_path: PathBuf,
) -> anyhow::Result<Keypair> {
    if let Some(secret_key) = parse_env::<SecretKey>(OPERATOR_KEY_ENVVAR) {
        info!("using operator key from {OPERATOR_KEY_ENVVAR}");
        return Ok(Keypair::from_secret_key(SECP256K1, &secret_key));
    }

    let path = cli_path.unwrap_or(config_path);
    let contents = read_to_string(&path)?;
    let Ok(secret_key) = contents.trim().parse::<SecretKey>() else {
        anyhow::bail!("invalid operator key in {}", path.display());
    };

    Ok(Keypair::from_secret_key(SECP256K1, &secret_key))
}
