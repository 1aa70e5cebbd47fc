//! Provides some common, standalone utilities and wrappers over [`bitcoin`](bitcoin) to create
//! transactions and fee-estimation placeholders.

use bitcoin::{
    absolute::LockTime, secp256k1::XOnlyPublicKey, transaction, Address, Network, OutPoint,
    ScriptBuf, Transaction, TxIn, TxOut, Witness,
};
use borsh::BorshSerialize;

use crate::{
    constants::{DEFAULT_SEQUENCE, KEY_SPEND_SIGNATURE_SIZE},
    errors::{TxBuilderError, TxBuilderResult},
};

/// Create a bitcoin [`Transaction`] for the given transaction inputs and outputs.
pub fn create_tx(tx_ins: Vec<TxIn>, tx_outs: Vec<TxOut>) -> Transaction {
    Transaction {
        version: transaction::Version(2),
        lock_time: LockTime::from_consensus(0),
        input: tx_ins,
        output: tx_outs,
    }
}

/// Create a list of [`TxIn`]'s from given [`OutPoint`]'s.
///
/// This wraps the [`OutPoint`] in a structure that includes a blank `witness`, a blank
/// `script_sig` and the `sequence` set to enable replace-by-fee with no locktime.
pub fn create_tx_ins(utxos: impl IntoIterator<Item = OutPoint>) -> Vec<TxIn> {
    utxos
        .into_iter()
        .map(|previous_output| TxIn {
            previous_output,
            sequence: DEFAULT_SEQUENCE,
            script_sig: ScriptBuf::default(),
            witness: Witness::new(),
        })
        .collect()
}

/// The key-path-only taproot address of `internal_key`, as used by the fee wallet.
pub fn key_spend_address(internal_key: XOnlyPublicKey, network: Network) -> Address {
    Address::p2tr(bitcoin::secp256k1::SECP256K1, internal_key, None, network)
}

/// A witness of the same size as a key-path signature with the default sighash type.
pub fn key_spend_dummy_witness() -> Witness {
    let mut witness = Witness::new();
    witness.push([0u8; KEY_SPEND_SIGNATURE_SIZE]);
    witness
}

/// Length of `call` once Borsh-encoded as calldata.
///
/// The length of a call does not depend on output values, so it can be measured on a draft with
/// placeholder amounts before the change is known.
pub fn calldata_len<T: BorshSerialize>(call: &T) -> TxBuilderResult<usize> {
    borsh::to_vec(call)
        .map(|bytes| bytes.len())
        .map_err(|e| TxBuilderError::Encoding(e.to_string()))
}
