//! Hash functions with the exact byte semantics the covenant scripts reproduce with `OP_SHA256`.

use bitcoin::hashes::{sha256, sha256d, Hash, HashEngine};

use crate::buf::Buf32;

/// Direct untagged hash.
pub fn sha256(buf: &[u8]) -> Buf32 {
    sha256::Hash::hash(buf).into()
}

/// SHA256 over the concatenation of the given byte strings, i.e. `OP_CAT`s followed by
/// `OP_SHA256`.
pub fn sha256_concat(parts: &[&[u8]]) -> Buf32 {
    let mut engine = sha256::Hash::engine();
    for part in parts {
        engine.input(part);
    }
    sha256::Hash::from_engine(engine).into()
}

/// Double SHA256, as used for transaction ids.
pub fn hash256(buf: &[u8]) -> Buf32 {
    Buf32(sha256d::Hash::hash(buf).to_byte_array())
}

/// Returns `sha256(tag) ‖ sha256(tag)`, the prefix of a BIP340 tagged hash.
pub fn tag_prefix(tag: &[u8]) -> [u8; 64] {
    let tag_hash = sha256::Hash::hash(tag).to_byte_array();
    let mut prefix = [0u8; 64];
    prefix[..32].copy_from_slice(&tag_hash);
    prefix[32..].copy_from_slice(&tag_hash);
    prefix
}

/// BIP340 tagged hash: `sha256(sha256(tag) ‖ sha256(tag) ‖ msg)`.
pub fn tagged_hash(tag: &[u8], msg: &[u8]) -> Buf32 {
    sha256_concat(&[&tag_prefix(tag), msg])
}
