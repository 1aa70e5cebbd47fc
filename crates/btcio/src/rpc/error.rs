//! Error types for the chain collaborators.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Error as SerdeJsonError;
use thiserror::Error;

/// Error raised by a chain, UTXO or signer collaborator.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientError {
    /// Missing username or password for the RPC server.
    #[error("missing username or password")]
    MissingUserPassword,

    /// The RPC server returned an error.
    ///
    /// Codes are listed in `bitcoind`'s `src/rpc/protocol.h`.
    #[error("RPC server returned error '{1}' (code {0})")]
    Server(i32, String),

    /// The response could not be parsed.
    #[error("error parsing rpc response: {0}")]
    Parse(String),

    /// A request parameter could not be serialized.
    #[error("could not create RPC param: {0}")]
    Param(String),

    /// The HTTP exchange failed in a way retrying does not fix.
    #[error("transport: {0}")]
    Transport(String),

    /// The server kept failing after every retry.
    #[error("max retries {0} exceeded")]
    MaxRetriesExceeded(u8),

    /// Waited too long for the chain.
    #[error("timeout")]
    Timeout,

    /// The transaction or output is not known to the provider.
    #[error("not found: {0}")]
    NotFound(String),

    /// The transaction was rejected by the chain.
    #[error("transaction rejected: {0}")]
    Rejected(String),

    /// The signer could not sign a transaction.
    #[error("signing failed: {0}")]
    Signing(String),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl From<SerdeJsonError> for ClientError {
    fn from(value: SerdeJsonError) -> Self {
        Self::Parse(value.to_string())
    }
}

/// Error object of a `bitcoind` JSON-RPC response.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BitcoinRpcError {
    /// The error code.
    pub code: i32,

    /// The error message.
    pub message: String,
}

impl fmt::Display for BitcoinRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPC error {}: {}", self.code, self.message)
    }
}

impl From<BitcoinRpcError> for ClientError {
    fn from(value: BitcoinRpcError) -> Self {
        Self::Server(value.code, value.message)
    }
}

/// Result alias with [`ClientError`] as the error type.
pub type ClientResult<T> = Result<T, ClientError>;
