use bitcoin::{
    absolute::LockTime,
    hashes::Hash,
    secp256k1::{rand::thread_rng, Keypair, SECP256K1},
    transaction::Version,
    Address, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};

use crate::random_buf32;

pub fn generate_keypair() -> Keypair {
    Keypair::new(SECP256K1, &mut thread_rng())
}

pub fn taproot_address(keypair: &Keypair) -> Address {
    Address::p2tr(
        SECP256K1,
        keypair.x_only_public_key().0,
        None,
        Network::Regtest,
    )
}

/// A P2TR script of a fresh key nobody keeps.
pub fn random_p2tr_script() -> ScriptBuf {
    taproot_address(&generate_keypair()).script_pubkey()
}

/// A transaction spending a random outpoint into `outputs`.
///
/// Its input carries no witness; use it only where the funding itself is not validated.
pub fn funding_tx(outputs: Vec<TxOut>) -> Transaction {
    let txid = random_buf32();

    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(Txid::from_byte_array(txid.0), 0),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        }],
        output: outputs,
    }
}
