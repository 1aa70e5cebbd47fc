//! Sighash preimage binding.
//!
//! A covenant script cannot read the transaction spending it, so the spender pushes the BIP341
//! sighash preimage fields as witness elements. The script concatenates them, derives the BIP340
//! challenge `e` for a signature by the generator point with nonce `1`, and checks the resulting
//! signature `Gx ‖ (e + 1)` with `OP_CHECKSIG`. That signature only verifies if the fields hash to
//! the real sighash, so every constraint on the fields is a constraint on the transaction.
//!
//! The `+ 1` is done with `OP_1ADD` on the challenge's last byte, which only works if that byte
//! is below `127`. About half of all transactions fail this, which is why the transaction builder
//! grinds the sequence number of its last input until every covenant input is bindable.

use bitcoin::{
    consensus::encode::serialize,
    hashes::Hash,
    secp256k1::schnorr,
    sighash::{Prevouts, SighashCache, TapSighashType},
    TapLeafHash, Transaction, TxOut,
};
use catbridge_primitives::{
    buf::Buf32,
    constants::GENERATOR_X,
    hash::{sha256, tagged_hash},
};

use crate::errors::{CovenantError, CovenantResult};

/// BIP340 tag of the sighash.
pub const TAP_SIGHASH_TAG: &[u8] = b"TapSighash";

/// BIP340 tag of the schnorr challenge.
pub const CHALLENGE_TAG: &[u8] = b"BIP0340/challenge";

/// The sighash epoch byte prefixed to every taproot sighash message.
pub const SIGHASH_EPOCH: u8 = 0x00;

/// Spend type of a script path spend without annex (`ext_flag = 1`).
pub const SCRIPT_PATH_SPEND_TYPE: u8 = 0x02;

/// Tapscript key version.
pub const KEY_VERSION_0: u8 = 0x00;

/// Code separator position when no `OP_CODESEPARATOR` was executed.
pub const NO_CODESEPARATOR: u32 = 0xffff_ffff;

/// The largest challenge suffix that can be incremented as a positive one-byte script number.
pub const MAX_E_SUFFIX: u8 = 126;

/// Number of sighash fields pushed as witness elements.
pub const PREIMAGE_FIELD_COUNT: usize = 13;

/// The sighash preimage of a tapscript input, plus its split schnorr challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SHPreimage {
    /// Sighash type, always [`TapSighashType::Default`].
    pub hash_type: u8,

    /// Transaction version, little endian.
    pub version: [u8; 4],

    /// Transaction locktime, little endian.
    pub lock_time: [u8; 4],

    /// SHA256 of all serialized spent outpoints.
    pub sha_prevouts: Buf32,

    /// SHA256 of all spent amounts.
    pub sha_amounts: Buf32,

    /// SHA256 of all spent script pubkeys.
    pub sha_script_pubkeys: Buf32,

    /// SHA256 of all input sequences.
    pub sha_sequences: Buf32,

    /// SHA256 of all serialized outputs.
    pub sha_outputs: Buf32,

    /// Spend type byte.
    pub spend_type: u8,

    /// Index of the input being signed, little endian.
    pub input_index: [u8; 4],

    /// Hash of the tapleaf being executed.
    pub tapleaf_hash: Buf32,

    /// Key version byte.
    pub key_version: u8,

    /// Position of the last executed code separator, little endian.
    pub codesep_pos: [u8; 4],

    /// First 31 bytes of the challenge.
    pub e_prefix: [u8; 31],

    /// Last byte of the challenge.
    pub e_suffix: u8,
}

/// SHA256 over the consensus serialization of every item.
fn sha_serialized<'a, T>(items: impl IntoIterator<Item = &'a T>) -> Buf32
where
    T: bitcoin::consensus::Encodable + 'a,
{
    let buf: Vec<u8> = items.into_iter().flat_map(serialize).collect();
    sha256(&buf)
}

/// `sha_prevouts` of a set of inputs.
pub fn hash_prevouts<'a>(outpoints: impl IntoIterator<Item = &'a bitcoin::OutPoint>) -> Buf32 {
    sha_serialized(outpoints)
}

/// `sha_outputs` of a set of outputs.
pub fn hash_outputs<'a>(outputs: impl IntoIterator<Item = &'a TxOut>) -> Buf32 {
    sha_serialized(outputs)
}

/// The BIP340 challenge of a signature with nonce point `G` by key `G` over `sighash`.
pub fn binding_challenge(sighash: &Buf32) -> Buf32 {
    tagged_hash(
        CHALLENGE_TAG,
        &[GENERATOR_X.as_slice(), GENERATOR_X.as_slice(), sighash.as_ref()].concat(),
    )
}

impl SHPreimage {
    /// Computes the preimage of input `input_index` of `tx` executing the leaf `leaf_hash`.
    ///
    /// The result may not be bindable; see [`Self::is_bindable`].
    pub fn from_tx(
        tx: &Transaction,
        prevouts: &[TxOut],
        input_index: usize,
        leaf_hash: TapLeafHash,
    ) -> CovenantResult<Self> {
        if prevouts.len() != tx.input.len() {
            return Err(CovenantError::Validation(format!(
                "{} prevouts for {} inputs",
                prevouts.len(),
                tx.input.len()
            )));
        }
        if input_index >= tx.input.len() {
            return Err(CovenantError::InputIndex {
                expected: tx.input.len(),
                got: input_index,
            });
        }

        let amounts: Vec<u8> = prevouts
            .iter()
            .flat_map(|txout| txout.value.to_sat().to_le_bytes())
            .collect();
        let sequences: Vec<u8> = tx
            .input
            .iter()
            .flat_map(|txin| txin.sequence.0.to_le_bytes())
            .collect();

        let mut preimage = Self {
            hash_type: TapSighashType::Default as u8,
            version: tx.version.0.to_le_bytes(),
            lock_time: tx.lock_time.to_consensus_u32().to_le_bytes(),
            sha_prevouts: hash_prevouts(tx.input.iter().map(|txin| &txin.previous_output)),
            sha_amounts: sha256(&amounts),
            sha_script_pubkeys: sha_serialized(prevouts.iter().map(|txout| &txout.script_pubkey)),
            sha_sequences: sha256(&sequences),
            sha_outputs: hash_outputs(&tx.output),
            spend_type: SCRIPT_PATH_SPEND_TYPE,
            input_index: (input_index as u32).to_le_bytes(),
            tapleaf_hash: Buf32(leaf_hash.to_byte_array()),
            key_version: KEY_VERSION_0,
            codesep_pos: NO_CODESEPARATOR.to_le_bytes(),
            e_prefix: [0; 31],
            e_suffix: 0,
        };

        let e = binding_challenge(&preimage.sighash());
        preimage.e_prefix.copy_from_slice(&e.0[..31]);
        preimage.e_suffix = e.0[31];

        Ok(preimage)
    }

    /// The thirteen sighash fields in message order.
    pub fn fields(&self) -> [Vec<u8>; PREIMAGE_FIELD_COUNT] {
        [
            vec![self.hash_type],
            self.version.to_vec(),
            self.lock_time.to_vec(),
            self.sha_prevouts.0.to_vec(),
            self.sha_amounts.0.to_vec(),
            self.sha_script_pubkeys.0.to_vec(),
            self.sha_sequences.0.to_vec(),
            self.sha_outputs.0.to_vec(),
            vec![self.spend_type],
            self.input_index.to_vec(),
            self.tapleaf_hash.0.to_vec(),
            vec![self.key_version],
            self.codesep_pos.to_vec(),
        ]
    }

    /// The taproot sighash the fields hash to.
    pub fn sighash(&self) -> Buf32 {
        let mut msg = vec![SIGHASH_EPOCH];
        for field in self.fields() {
            msg.extend_from_slice(&field);
        }
        tagged_hash(TAP_SIGHASH_TAG, &msg)
    }

    /// The index of the input this preimage belongs to.
    pub fn input_index(&self) -> usize {
        u32::from_le_bytes(self.input_index) as usize
    }

    /// Returns `true` if a script can rebuild the binding signature from this challenge.
    pub fn is_bindable(&self) -> bool {
        self.e_suffix <= MAX_E_SUFFIX
    }

    /// Checks the preimage the way the covenant script does and returns the binding signature.
    ///
    /// The returned signature verifies under [`PREIMAGE_BINDING_PUBKEY`] for the message
    /// [`Self::sighash`].
    ///
    /// [`PREIMAGE_BINDING_PUBKEY`]: catbridge_primitives::constants::PREIMAGE_BINDING_PUBKEY
    pub fn check_preimage(&self) -> CovenantResult<schnorr::Signature> {
        if !self.is_bindable() {
            return Err(CovenantError::PreimageUnbindable(self.e_suffix));
        }

        let e = binding_challenge(&self.sighash());
        if e.0[..31] != self.e_prefix || e.0[31] != self.e_suffix {
            return Err(CovenantError::PreimageMismatch);
        }

        let mut sig = [0u8; 64];
        sig[..32].copy_from_slice(&GENERATOR_X);
        sig[32..63].copy_from_slice(&self.e_prefix);
        sig[63] = self.e_suffix + 1;

        schnorr::Signature::from_slice(&sig).map_err(|_| CovenantError::PreimageMismatch)
    }

    /// The witness elements carrying this preimage: the fields, then `_e`, then `eSuffix` as a
    /// minimally encoded script number.
    pub fn witness_elements(&self) -> Vec<Vec<u8>> {
        let mut elements: Vec<Vec<u8>> = self.fields().into_iter().collect();
        elements.push(self.e_prefix.to_vec());
        elements.push(if self.e_suffix == 0 {
            vec![]
        } else {
            vec![self.e_suffix]
        });
        elements
    }

    /// Parses the elements produced by [`Self::witness_elements`].
    pub fn from_witness_elements(elements: &[&[u8]]) -> CovenantResult<Self> {
        if elements.len() != PREIMAGE_FIELD_COUNT + 2 {
            return Err(CovenantError::MalformedWitness(format!(
                "expected {} preimage elements, got {}",
                PREIMAGE_FIELD_COUNT + 2,
                elements.len()
            )));
        }

        fn byte(el: &[u8]) -> CovenantResult<u8> {
            match el {
                [b] => Ok(*b),
                _ => Err(CovenantError::MalformedWitness(format!(
                    "expected 1 byte, got {}",
                    el.len()
                ))),
            }
        }

        fn word(el: &[u8]) -> CovenantResult<[u8; 4]> {
            el.try_into().map_err(|_| {
                CovenantError::MalformedWitness(format!("expected 4 bytes, got {}", el.len()))
            })
        }

        fn hash(el: &[u8]) -> CovenantResult<Buf32> {
            Buf32::from_slice(el).map_err(CovenantError::from)
        }

        let e_suffix = match elements[14] {
            [] => 0,
            [b] if *b < 0x80 => *b,
            other => {
                return Err(CovenantError::MalformedWitness(format!(
                    "challenge suffix {other:?} is not a small positive number"
                )))
            }
        };

        Ok(Self {
            hash_type: byte(elements[0])?,
            version: word(elements[1])?,
            lock_time: word(elements[2])?,
            sha_prevouts: hash(elements[3])?,
            sha_amounts: hash(elements[4])?,
            sha_script_pubkeys: hash(elements[5])?,
            sha_sequences: hash(elements[6])?,
            sha_outputs: hash(elements[7])?,
            spend_type: byte(elements[8])?,
            input_index: word(elements[9])?,
            tapleaf_hash: hash(elements[10])?,
            key_version: byte(elements[11])?,
            codesep_pos: word(elements[12])?,
            e_prefix: elements[13].try_into().map_err(|_| {
                CovenantError::MalformedWitness("challenge prefix must be 31 bytes".to_string())
            })?,
            e_suffix,
        })
    }
}

/// Computes the real sighash of a tapscript input with rust-bitcoin.
///
/// Used to sign with the operator key and to cross-check [`SHPreimage::sighash`].
pub fn script_spend_sighash(
    tx: &Transaction,
    prevouts: &[TxOut],
    input_index: usize,
    leaf_hash: TapLeafHash,
) -> CovenantResult<Buf32> {
    let sighash = SighashCache::new(tx)
        .taproot_script_spend_signature_hash(
            input_index,
            &Prevouts::All(prevouts),
            leaf_hash,
            TapSighashType::Default,
        )
        .map_err(|e| CovenantError::Validation(format!("sighash: {e}")))?;

    Ok(Buf32(sighash.to_byte_array()))
}
