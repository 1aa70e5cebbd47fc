//! Re-exports of the most commonly used primitives.

pub use crate::{
    amount::{encode_amount, encode_level, BitcoinAmount},
    buf::Buf32,
    constants::*,
    errors::{PrimitivesError, PrimitivesResult},
    hash::{hash256, sha256, sha256_concat, tagged_hash},
    utxo::{CovenantUtxo, Utxo},
};
