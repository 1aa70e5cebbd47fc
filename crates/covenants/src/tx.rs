//! The covenant view of a transaction.
//!
//! Covenant methods receive the transactions that created the outputs they spend as calldata and
//! recompute their ids to authenticate them against the spent outpoints. [`CovenantTx`] is that
//! calldata form: it keeps exactly what the legacy serialization needs, with every `scriptSig`
//! assumed empty.

use bitcoin::{
    absolute::LockTime,
    consensus::encode::{serialize, VarInt},
    opcodes::all::OP_RETURN,
    script::{Instruction, PushBytesBuf},
    transaction::Version,
    Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use borsh::{BorshDeserialize, BorshSerialize};
use catbridge_primitives::{
    buf::Buf32,
    constants::{HASH_SIZE, MAX_STATE_HASHES},
    hash::hash256,
};
use serde::{Deserialize, Serialize};

use crate::errors::{CovenantError, CovenantResult};

/// Index of the state commitment output in every stateful covenant transaction.
pub const STATE_OUTPUT_INDEX: u32 = 0;

/// An outpoint in calldata form.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize,
)]
pub struct Prevout {
    /// Txid in internal byte order.
    pub txid: Buf32,

    /// Output index.
    pub vout: u32,
}

impl From<OutPoint> for Prevout {
    fn from(value: OutPoint) -> Self {
        Self {
            txid: value.txid.into(),
            vout: value.vout,
        }
    }
}

impl From<Prevout> for OutPoint {
    fn from(value: Prevout) -> Self {
        OutPoint::new(value.txid.into(), value.vout)
    }
}

/// A transaction input without its `scriptSig` and witness.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize,
)]
pub struct CovenantTxIn {
    /// The spent outpoint.
    pub prevout: Prevout,

    /// The input sequence.
    pub sequence: u32,
}

/// A transaction output in calldata form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct CovenantTxOut {
    /// Value in sats.
    pub value: u64,

    /// The locking script.
    pub script: Vec<u8>,
}

impl From<&TxOut> for CovenantTxOut {
    fn from(value: &TxOut) -> Self {
        Self {
            value: value.value.to_sat(),
            script: value.script_pubkey.to_bytes(),
        }
    }
}

impl From<&CovenantTxOut> for TxOut {
    fn from(value: &CovenantTxOut) -> Self {
        TxOut {
            value: Amount::from_sat(value.value),
            script_pubkey: ScriptBuf::from_bytes(value.script.clone()),
        }
    }
}

/// A transaction reduced to the fields its id commits to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct CovenantTx {
    /// Transaction version.
    pub version: i32,

    /// Inputs.
    pub inputs: Vec<CovenantTxIn>,

    /// Outputs.
    pub outputs: Vec<CovenantTxOut>,

    /// Locktime.
    pub lock_time: u32,
}

impl CovenantTx {
    /// Builds the covenant view of a chain transaction, dropping `scriptSig`s and witnesses.
    pub fn from_transaction(tx: &Transaction) -> Self {
        Self {
            version: tx.version.0,
            inputs: tx
                .input
                .iter()
                .map(|txin| CovenantTxIn {
                    prevout: txin.previous_output.into(),
                    sequence: txin.sequence.0,
                })
                .collect(),
            outputs: tx.output.iter().map(CovenantTxOut::from).collect(),
            lock_time: tx.lock_time.to_consensus_u32(),
        }
    }

    /// Rebuilds an unsigned [`Transaction`].
    pub fn to_transaction(&self) -> Transaction {
        Transaction {
            version: Version(self.version),
            lock_time: LockTime::from_consensus(self.lock_time),
            input: self
                .inputs
                .iter()
                .map(|txin| TxIn {
                    previous_output: txin.prevout.into(),
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence(txin.sequence),
                    witness: Witness::new(),
                })
                .collect(),
            output: self.outputs.iter().map(TxOut::from).collect(),
        }
    }

    /// The legacy serialization with empty `scriptSig`s.
    pub fn serialize_legacy(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.version.to_le_bytes());

        buf.extend(serialize(&VarInt(self.inputs.len() as u64)));
        for txin in &self.inputs {
            buf.extend_from_slice(txin.prevout.txid.as_ref());
            buf.extend_from_slice(&txin.prevout.vout.to_le_bytes());
            buf.push(0x00);
            buf.extend_from_slice(&txin.sequence.to_le_bytes());
        }

        buf.extend(serialize(&VarInt(self.outputs.len() as u64)));
        for txout in &self.outputs {
            buf.extend_from_slice(&txout.value.to_le_bytes());
            buf.extend(serialize(&VarInt(txout.script.len() as u64)));
            buf.extend_from_slice(&txout.script);
        }

        buf.extend_from_slice(&self.lock_time.to_le_bytes());
        buf
    }

    /// The covenant id function: `hash256` of [`Self::serialize_legacy`].
    pub fn txid(&self) -> Txid {
        hash256(&self.serialize_legacy()).into()
    }

    /// The outpoint of output `vout`.
    pub fn outpoint(&self, vout: u32) -> OutPoint {
        OutPoint::new(self.txid(), vout)
    }

    /// Output `vout`, if present.
    pub fn output(&self, vout: u32) -> CovenantResult<&CovenantTxOut> {
        self.outputs.get(vout as usize).ok_or_else(|| {
            CovenantError::Validation(format!("transaction has no output {vout}"))
        })
    }

    /// The outpoint spent by input `index`, if present.
    pub fn input_prevout(&self, index: usize) -> Option<OutPoint> {
        self.inputs.get(index).map(|txin| txin.prevout.into())
    }

    /// The hashes committed by the state output.
    pub fn state_hashes(&self) -> CovenantResult<Vec<Buf32>> {
        let out = self.output(STATE_OUTPUT_INDEX)?;
        parse_state_script(&ScriptBuf::from_bytes(out.script.clone()))
    }

    /// The state hash bound to contract output `vout`.
    pub fn state_hash_for(&self, vout: u32) -> CovenantResult<Buf32> {
        if vout == STATE_OUTPUT_INDEX {
            return Err(CovenantError::Validation(
                "output 0 carries the state, not a contract".to_string(),
            ));
        }
        self.state_hashes()?
            .get(vout as usize - 1)
            .copied()
            .ok_or_else(|| CovenantError::MalformedState(format!("no state hash for output {vout}")))
    }
}

/// The `OP_RETURN` script committing to one or two state hashes.
pub fn state_script(hashes: &[Buf32]) -> CovenantResult<ScriptBuf> {
    if hashes.is_empty() || hashes.len() > MAX_STATE_HASHES {
        return Err(CovenantError::MalformedState(format!(
            "{} state hashes",
            hashes.len()
        )));
    }

    let data: Vec<u8> = hashes.iter().flat_map(|h| h.0).collect();
    let push = PushBytesBuf::try_from(data)
        .map_err(|e| CovenantError::MalformedState(e.to_string()))?;

    Ok(ScriptBuf::new_op_return(push))
}

/// The zero-value state commitment output.
pub fn state_output(hashes: &[Buf32]) -> CovenantResult<TxOut> {
    Ok(TxOut {
        value: Amount::ZERO,
        script_pubkey: state_script(hashes)?,
    })
}

/// A covenant contract output.
pub fn contract_output(script_pubkey: &ScriptBuf, amount: u64) -> TxOut {
    TxOut {
        value: Amount::from_sat(amount),
        script_pubkey: script_pubkey.clone(),
    }
}

/// Parses the hashes out of a state commitment script.
pub fn parse_state_script(script: &ScriptBuf) -> CovenantResult<Vec<Buf32>> {
    let mut instructions = script.instructions();

    match instructions.next() {
        Some(Ok(Instruction::Op(op))) if op == OP_RETURN => {}
        _ => {
            return Err(CovenantError::MalformedState(
                "state output must start with OP_RETURN".to_string(),
            ))
        }
    }

    let data = match instructions.next() {
        Some(Ok(Instruction::PushBytes(bytes))) => bytes.as_bytes().to_vec(),
        _ => {
            return Err(CovenantError::MalformedState(
                "state output has no data push".to_string(),
            ))
        }
    };

    if instructions.next().is_some() {
        return Err(CovenantError::MalformedState(
            "trailing data after state push".to_string(),
        ));
    }

    if data.is_empty()
        || data.len() % HASH_SIZE != 0
        || data.len() / HASH_SIZE > MAX_STATE_HASHES
    {
        return Err(CovenantError::MalformedState(format!(
            "state push of {} bytes",
            data.len()
        )));
    }

    data.chunks(HASH_SIZE)
        .map(|chunk| Buf32::from_slice(chunk).map_err(CovenantError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use bitcoin::key::TweakedPublicKey;
    use catbridge_primitives::{constants::UNSPENDABLE_INTERNAL_KEY, hash::sha256};

    use super::*;

    fn p2tr_script() -> ScriptBuf {
        let key = TweakedPublicKey::dangerous_assume_tweaked(*UNSPENDABLE_INTERNAL_KEY);
        ScriptBuf::new_p2tr_tweaked(key)
    }

    fn sample_tx() -> Transaction {
        let tx = CovenantTx {
            version: 2,
            inputs: vec![
                CovenantTxIn {
                    prevout: Prevout {
                        txid: sha256(b"a"),
                        vout: 1,
                    },
                    sequence: 0xffff_fffd,
                },
                CovenantTxIn {
                    prevout: Prevout {
                        txid: sha256(b"b"),
                        vout: 2,
                    },
                    sequence: 0x8000_0005,
                },
            ],
            outputs: vec![],
            lock_time: 0,
        };

        let mut tx = tx.to_transaction();
        tx.output = vec![
            state_output(&[sha256(b"s0"), sha256(b"s1")]).unwrap(),
            contract_output(&p2tr_script(), 5_000),
        ];
        tx
    }

    #[test]
    fn test_txid_matches_consensus() {
        let tx = sample_tx();
        let view = CovenantTx::from_transaction(&tx);
        assert_eq!(view.txid(), tx.compute_txid());
        assert_eq!(view.to_transaction(), tx);
    }

    #[test]
    fn test_witness_does_not_change_txid() {
        let mut tx = sample_tx();
        let before = CovenantTx::from_transaction(&tx).txid();
        tx.input[0].witness.push([1u8; 64]);
        assert_eq!(CovenantTx::from_transaction(&tx).txid(), before);
        assert_eq!(tx.compute_txid(), before);
    }

    #[test]
    fn test_state_hashes() {
        let view = CovenantTx::from_transaction(&sample_tx());
        let hashes = view.state_hashes().unwrap();
        assert_eq!(hashes, vec![sha256(b"s0"), sha256(b"s1")]);
        assert_eq!(view.state_hash_for(1).unwrap(), sha256(b"s0"));
        assert_eq!(view.state_hash_for(2).unwrap(), sha256(b"s1"));
        assert!(view.state_hash_for(3).is_err());
    }

    #[test]
    fn test_state_output_layout() {
        let out = state_output(&[Buf32::zero()]).unwrap();
        let bytes = out.script_pubkey.as_bytes();
        assert_eq!(out.value, Amount::ZERO);
        assert_eq!(bytes[0], OP_RETURN.to_u8());
        assert_eq!(bytes[1], 32);
        assert_eq!(bytes.len(), 34);

        assert!(state_output(&[]).is_err());
        assert!(state_output(&[Buf32::zero(); 3]).is_err());
    }

    #[test]
    fn test_rejects_non_state_script() {
        let push = PushBytesBuf::try_from(vec![1u8; 20]).unwrap();
        assert!(parse_state_script(&ScriptBuf::new_op_return(push)).is_err());
        assert!(parse_state_script(&p2tr_script()).is_err());
    }
}
