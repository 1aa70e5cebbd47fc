//! Covenant locking scripts and witnesses.
//!
//! Every covenant is a taproot output with the [`UNSPENDABLE_INTERNAL_KEY`] and a single leaf:
//!
//! ```text
//! <tag> OP_DROP [<peer spk> OP_DROP] <operator> OP_CHECKSIGVERIFY
//! <preimage binding program> <calldata cleanup> OP_1
//! ```
//!
//! The tag and peer script make the three covenant addresses distinct and chain them together, so
//! the same operator key always derives the same set.

use bitcoin::{
    opcodes::{
        all::{
            OP_0NOTEQUAL, OP_1ADD, OP_2DUP, OP_CAT, OP_CHECKSIGVERIFY, OP_DEPTH, OP_DROP, OP_DUP,
            OP_ENDIF, OP_EQUALVERIFY, OP_FROMALTSTACK, OP_IF, OP_LESSTHAN, OP_NOTIF, OP_PUSHNUM_1,
            OP_SHA256, OP_SWAP, OP_TOALTSTACK, OP_VERIFY,
        },
        Opcode,
    },
    script::{Builder, PushBytesBuf},
    secp256k1::{schnorr, XOnlyPublicKey, SECP256K1},
    taproot::{ControlBlock, LeafVersion, TaprootBuilder, TaprootSpendInfo},
    Address, Network, ScriptBuf, TapLeafHash, Witness,
};
use catbridge_primitives::{
    constants::{GENERATOR_X, UNSPENDABLE_INTERNAL_KEY},
    hash::tag_prefix,
};

use crate::{
    errors::{CovenantError, CovenantResult},
    preimage::{
        SHPreimage, CHALLENGE_TAG, MAX_E_SUFFIX, PREIMAGE_FIELD_COUNT, SIGHASH_EPOCH,
        TAP_SIGHASH_TAG,
    },
};

/// Largest witness stack element accepted by the script interpreter.
pub const MAX_ELEMENT_SIZE: usize = 520;

/// Number of calldata chunks the leaf script clears from the stack.
pub const MAX_CALLDATA_CHUNKS: usize = 8;

/// Witness elements after the calldata: preimage fields, `_e`, `eSuffix` and the operator
/// signature.
const FIXED_WITNESS_ELEMENTS: usize = PREIMAGE_FIELD_COUNT + 3;

fn push_bytes(builder: Builder, bytes: &[u8]) -> CovenantResult<Builder> {
    let data = PushBytesBuf::try_from(bytes.to_vec())
        .map_err(|e| CovenantError::Validation(format!("push too large: {e}")))?;
    Ok(builder.push_slice(data))
}

fn push_opcodes(mut builder: Builder, opcodes: &[Opcode]) -> Builder {
    for op in opcodes {
        builder = builder.push_opcode(*op);
    }
    builder
}

/// Appends the OP_CAT rendition of [`SHPreimage::check_preimage`].
///
/// Expects `f1..f13 _e eSuffix` on top of the stack and consumes them.
fn push_binding_program(builder: Builder) -> CovenantResult<Builder> {
    // eSuffix < 127
    let builder = push_opcodes(builder, &[OP_DUP])
        .push_int(MAX_E_SUFFIX as i64 + 1)
        .push_opcode(OP_LESSTHAN)
        .push_opcode(OP_VERIFY);

    // sig = Gx ‖ _e ‖ (eSuffix + 1), kept on the altstack
    let builder = push_opcodes(builder, &[OP_2DUP, OP_1ADD, OP_CAT]);
    let builder = push_bytes(builder, &GENERATOR_X)?;
    let builder = push_opcodes(builder, &[OP_SWAP, OP_CAT, OP_TOALTSTACK]);

    // e = _e ‖ eSuffix, where a zero suffix arrives as the empty vector
    let builder = push_opcodes(builder, &[OP_DUP, OP_0NOTEQUAL, OP_NOTIF, OP_DROP]);
    let builder = push_bytes(builder, &[0x00])?;
    let builder = push_opcodes(builder, &[OP_ENDIF, OP_CAT, OP_TOALTSTACK]);

    // sighash = TaggedHash("TapSighash", epoch ‖ f1 ‖ .. ‖ f13)
    let builder = push_opcodes(builder, &[OP_CAT; PREIMAGE_FIELD_COUNT - 1]);
    let sighash_prefix = [tag_prefix(TAP_SIGHASH_TAG).as_slice(), &[SIGHASH_EPOCH]].concat();
    let builder = push_bytes(builder, &sighash_prefix)?;
    let builder = push_opcodes(builder, &[OP_SWAP, OP_CAT, OP_SHA256]);

    // e' = TaggedHash("BIP0340/challenge", Gx ‖ Gx ‖ sighash)
    let challenge_prefix = [
        tag_prefix(CHALLENGE_TAG).as_slice(),
        GENERATOR_X.as_slice(),
        GENERATOR_X.as_slice(),
    ]
    .concat();
    let builder = push_bytes(builder, &challenge_prefix)?;
    let builder = push_opcodes(builder, &[OP_SWAP, OP_CAT, OP_SHA256]);

    let builder = push_opcodes(builder, &[OP_FROMALTSTACK, OP_EQUALVERIFY, OP_FROMALTSTACK]);
    let builder = push_bytes(builder, &GENERATOR_X)?;
    Ok(builder.push_opcode(OP_CHECKSIGVERIFY))
}

/// Builds the leaf script of a covenant.
pub fn covenant_leaf_script(
    tag: &[u8],
    peer: Option<&ScriptBuf>,
    operator: &XOnlyPublicKey,
) -> CovenantResult<ScriptBuf> {
    let mut builder = push_bytes(Builder::new(), tag)?.push_opcode(OP_DROP);
    if let Some(peer) = peer {
        builder = push_bytes(builder, peer.as_bytes())?.push_opcode(OP_DROP);
    }
    builder = builder
        .push_x_only_key(operator)
        .push_opcode(OP_CHECKSIGVERIFY);

    builder = push_binding_program(builder)?;

    for _ in 0..MAX_CALLDATA_CHUNKS {
        builder = push_opcodes(builder, &[OP_DEPTH, OP_0NOTEQUAL, OP_IF, OP_DROP, OP_ENDIF]);
    }

    Ok(builder.push_opcode(OP_PUSHNUM_1).into_script())
}

/// A derived covenant output: leaf script, taproot spend info and address.
#[derive(Debug, Clone)]
pub struct CovenantScript {
    operator: XOnlyPublicKey,
    leaf_script: ScriptBuf,
    spend_info: TaprootSpendInfo,
    address: Address,
}

impl CovenantScript {
    /// Derives the covenant output for `operator`, optionally committing to a peer covenant.
    pub fn new(
        tag: &[u8],
        peer: Option<&ScriptBuf>,
        operator: &XOnlyPublicKey,
        network: Network,
    ) -> CovenantResult<Self> {
        let leaf_script = covenant_leaf_script(tag, peer, operator)?;

        let spend_info = TaprootBuilder::new()
            .add_leaf(0, leaf_script.clone())?
            .finalize(SECP256K1, *UNSPENDABLE_INTERNAL_KEY)?;

        let address = Address::p2tr(
            SECP256K1,
            *UNSPENDABLE_INTERNAL_KEY,
            spend_info.merkle_root(),
            network,
        );

        Ok(Self {
            operator: *operator,
            leaf_script,
            spend_info,
            address,
        })
    }

    /// The operator key that must co-sign every spend.
    pub fn operator(&self) -> &XOnlyPublicKey {
        &self.operator
    }

    /// The tapscript leaf.
    pub fn leaf_script(&self) -> &ScriptBuf {
        &self.leaf_script
    }

    /// Hash of the tapscript leaf, committed by every sighash of a spend.
    pub fn leaf_hash(&self) -> TapLeafHash {
        TapLeafHash::from_script(&self.leaf_script, LeafVersion::TapScript)
    }

    /// The control block proving the leaf is committed by the output key.
    pub fn control_block(&self) -> CovenantResult<ControlBlock> {
        self.spend_info
            .control_block(&(self.leaf_script.clone(), LeafVersion::TapScript))
            .ok_or(CovenantError::ControlBlock)
    }

    /// The covenant address.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The 34-byte P2TR locking script.
    pub fn script_pubkey(&self) -> ScriptBuf {
        self.address.script_pubkey()
    }

    /// A witness of the same size as a real one, for fee estimation.
    pub fn dummy_witness(&self, calldata_len: usize) -> CovenantResult<Witness> {
        let preimage = SHPreimage {
            hash_type: 0,
            version: [0; 4],
            lock_time: [0; 4],
            sha_prevouts: Default::default(),
            sha_amounts: Default::default(),
            sha_script_pubkeys: Default::default(),
            sha_sequences: Default::default(),
            sha_outputs: Default::default(),
            spend_type: 0,
            input_index: [0; 4],
            tapleaf_hash: Default::default(),
            key_version: 0,
            codesep_pos: [0; 4],
            e_prefix: [0; 31],
            e_suffix: MAX_E_SUFFIX,
        };
        let operator_sig = schnorr::Signature::from_slice(&[1u8; 64])
            .map_err(|_| CovenantError::OperatorSignature)?;

        CovenantWitness {
            calldata: vec![0; calldata_len],
            preimage,
            operator_sig,
            leaf_script: self.leaf_script.clone(),
            control_block: self.control_block()?,
        }
        .to_witness()
    }
}

/// The decoded witness of a covenant spend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CovenantWitness {
    /// The Borsh-encoded method call.
    pub calldata: Vec<u8>,

    /// The sighash preimage of the input.
    pub preimage: SHPreimage,

    /// The operator signature over the sighash.
    pub operator_sig: schnorr::Signature,

    /// The executed leaf.
    pub leaf_script: ScriptBuf,

    /// The control block of the leaf.
    pub control_block: ControlBlock,
}

impl CovenantWitness {
    /// Serializes the witness stack, bottom first.
    ///
    /// Fails if the calldata does not fit in [`MAX_CALLDATA_CHUNKS`] elements.
    pub fn to_witness(&self) -> CovenantResult<Witness> {
        if self.calldata.len() > MAX_CALLDATA_CHUNKS * MAX_ELEMENT_SIZE {
            return Err(CovenantError::CalldataTooLarge(self.calldata.len()));
        }

        let mut witness = Witness::new();

        if self.calldata.is_empty() {
            witness.push(Vec::<u8>::new());
        }
        for chunk in self.calldata.chunks(MAX_ELEMENT_SIZE) {
            witness.push(chunk);
        }

        for element in self.preimage.witness_elements() {
            witness.push(element);
        }
        witness.push(self.operator_sig.serialize());
        witness.push(self.leaf_script.as_bytes());
        witness.push(self.control_block.serialize());

        Ok(witness)
    }

    /// Parses a covenant witness stack.
    pub fn from_witness(witness: &Witness) -> CovenantResult<Self> {
        let elements: Vec<&[u8]> = witness.iter().collect();
        let n = elements.len();
        if n < FIXED_WITNESS_ELEMENTS + 3 {
            return Err(CovenantError::MalformedWitness(format!(
                "{n} elements is too few"
            )));
        }

        let control_block = ControlBlock::decode(elements[n - 1])
            .map_err(|e| CovenantError::MalformedWitness(format!("control block: {e}")))?;
        let leaf_script = ScriptBuf::from_bytes(elements[n - 2].to_vec());
        let operator_sig = schnorr::Signature::from_slice(elements[n - 3])
            .map_err(|_| CovenantError::OperatorSignature)?;

        let fixed_start = n - 2 - FIXED_WITNESS_ELEMENTS;
        let preimage = SHPreimage::from_witness_elements(&elements[fixed_start..n - 3])?;

        let chunks = &elements[..fixed_start];
        if chunks.len() > MAX_CALLDATA_CHUNKS {
            return Err(CovenantError::MalformedWitness(format!(
                "{} calldata chunks",
                chunks.len()
            )));
        }
        let calldata = chunks.concat();

        Ok(Self {
            calldata,
            preimage,
            operator_sig,
            leaf_script,
            control_block,
        })
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::secp256k1::Keypair;
    use catbridge_primitives::constants::P2TR_SCRIPT_SIZE;

    use super::*;

    fn operator() -> XOnlyPublicKey {
        let keypair = Keypair::new(SECP256K1, &mut bitcoin::secp256k1::rand::thread_rng());
        keypair.x_only_public_key().0
    }

    #[test]
    fn test_covenant_script_is_deterministic() {
        let op = operator();
        let a = CovenantScript::new(b"a", None, &op, Network::Regtest).unwrap();
        let b = CovenantScript::new(b"a", None, &op, Network::Regtest).unwrap();
        let c = CovenantScript::new(b"c", None, &op, Network::Regtest).unwrap();

        assert_eq!(a.address(), b.address());
        assert_ne!(a.address(), c.address());
        assert_eq!(a.script_pubkey().len(), P2TR_SCRIPT_SIZE);

        let cb = a.control_block().unwrap();
        let output_key = a.spend_info.output_key().to_inner();
        assert!(cb.verify_taproot_commitment(SECP256K1, output_key, a.leaf_script()));
    }

    #[test]
    fn test_peer_changes_address() {
        let op = operator();
        let peer = CovenantScript::new(b"peer", None, &op, Network::Regtest).unwrap();
        let with_peer =
            CovenantScript::new(b"a", Some(&peer.script_pubkey()), &op, Network::Regtest).unwrap();
        let without = CovenantScript::new(b"a", None, &op, Network::Regtest).unwrap();
        assert_ne!(with_peer.address(), without.address());
    }

    #[test]
    fn test_witness_layout_parses_back() {
        let script = CovenantScript::new(b"a", None, &operator(), Network::Regtest).unwrap();

        for calldata_len in [0, 1, MAX_ELEMENT_SIZE, MAX_ELEMENT_SIZE * 2 + 7] {
            let witness = script.dummy_witness(calldata_len).unwrap();
            let chunks = calldata_len.div_ceil(MAX_ELEMENT_SIZE).max(1);
            assert_eq!(witness.len(), chunks + FIXED_WITNESS_ELEMENTS + 2);

            let parsed = CovenantWitness::from_witness(&witness).unwrap();
            assert_eq!(parsed.calldata.len(), calldata_len);
            assert_eq!(&parsed.leaf_script, script.leaf_script());
            assert_eq!(parsed.preimage.e_suffix, MAX_E_SUFFIX);
        }
    }

    #[test]
    fn test_calldata_limit() {
        let script = CovenantScript::new(b"a", None, &operator(), Network::Regtest).unwrap();
        let limit = MAX_CALLDATA_CHUNKS * MAX_ELEMENT_SIZE;

        let witness = script.dummy_witness(limit).unwrap();
        assert_eq!(witness.len(), MAX_CALLDATA_CHUNKS + FIXED_WITNESS_ELEMENTS + 2);
        assert_eq!(
            CovenantWitness::from_witness(&witness).unwrap().calldata.len(),
            limit
        );

        assert!(matches!(
            script.dummy_witness(limit + 1),
            Err(CovenantError::CalldataTooLarge(n)) if n == limit + 1
        ));
    }
}
