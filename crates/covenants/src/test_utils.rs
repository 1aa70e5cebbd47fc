//! Transaction fixtures for covenant tests.

use bitcoin::{
    absolute::LockTime,
    secp256k1::{rand::thread_rng, Keypair, SECP256K1},
    transaction::Version,
    Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};
use catbridge_primitives::{buf::Buf32, hash::sha256};

use crate::{
    preimage::SHPreimage,
    scripts::CovenantScript,
    set::CovenantSet,
    tx::{state_output, CovenantTx, CovenantTxIn, CovenantTxOut, Prevout},
};

pub(crate) const FEE_VALUE: u64 = 50_000;

pub(crate) fn operator() -> Keypair {
    Keypair::new(SECP256K1, &mut thread_rng())
}

pub(crate) fn covenants(operator: &Keypair) -> CovenantSet {
    CovenantSet::derive(&operator.x_only_public_key().0, Network::Regtest).unwrap()
}

pub(crate) fn p2tr(seed: u8) -> ScriptBuf {
    let mut script = vec![0x51, 0x20];
    script.extend_from_slice(sha256(&[seed]).as_ref());
    ScriptBuf::from_bytes(script)
}

/// A transaction funded from nowhere that creates `outputs`.
pub(crate) fn prev_tx(seed: u8, outputs: Vec<TxOut>) -> CovenantTx {
    CovenantTx {
        version: 2,
        inputs: vec![CovenantTxIn {
            prevout: Prevout {
                txid: sha256(&[0xfe, seed]),
                vout: 0,
            },
            sequence: 0xffff_fffd,
        }],
        outputs: outputs.iter().map(CovenantTxOut::from).collect(),
        lock_time: 0,
    }
}

/// A stateful transaction with a single state hash and a single contract output.
pub(crate) fn stateful_tx(seed: u8, state: Buf32, script: &ScriptBuf, amount: u64) -> CovenantTx {
    prev_tx(
        seed,
        vec![
            state_output(&[state]).unwrap(),
            TxOut {
                value: Amount::from_sat(amount),
                script_pubkey: script.clone(),
            },
        ],
    )
}

pub(crate) fn fee_input(seed: u8) -> (OutPoint, TxOut) {
    let tx = prev_tx(
        seed,
        vec![TxOut {
            value: Amount::from_sat(FEE_VALUE),
            script_pubkey: p2tr(seed),
        }],
    );
    (tx.outpoint(0), TxOut::from(&tx.outputs[0]))
}

pub(crate) fn change_output() -> CovenantTxOut {
    CovenantTxOut {
        value: FEE_VALUE - 2_000,
        script: p2tr(0xcc).to_bytes(),
    }
}

/// Builds the spending transaction and grinds the last input's sequence until every covenant
/// input in `covenant_inputs` is bindable.
pub(crate) fn spend(
    inputs: &[(OutPoint, TxOut)],
    outputs: Vec<TxOut>,
    covenant_inputs: &[(usize, &CovenantScript)],
) -> (Transaction, Vec<TxOut>) {
    let prevouts: Vec<TxOut> = inputs.iter().map(|(_, txout)| txout.clone()).collect();
    let mut tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs
            .iter()
            .map(|(outpoint, _)| TxIn {
                previous_output: *outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence(0xffff_fffd),
                witness: Witness::new(),
            })
            .collect(),
        output: outputs,
    };

    let last = tx.input.len() - 1;
    let mut sequence = 0x8000_0000u32;
    loop {
        tx.input[last].sequence = Sequence(sequence);
        let bindable = covenant_inputs.iter().all(|(index, script)| {
            SHPreimage::from_tx(&tx, &prevouts, *index, script.leaf_hash())
                .unwrap()
                .is_bindable()
        });
        if bindable {
            return (tx, prevouts);
        }
        sequence += 1;
    }
}
