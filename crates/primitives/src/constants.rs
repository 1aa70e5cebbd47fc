//! Protocol constants shared across the bridge crates.

use std::str::FromStr;

use bitcoin::secp256k1::XOnlyPublicKey;

use crate::buf::Buf32;

/// The size (in bytes) of a Hash (such as [`Txid`](bitcoin::Txid)).
pub const HASH_SIZE: usize = 32;

/// Largest amount a covenant can carry: the maximum positive 4-byte script number.
pub const MAX_SCRIPT_AMOUNT: u64 = 0x7fff_ffff;

/// The size (in bytes) of an L2 account address that deposits are credited to.
pub const L2_ADDRESS_SIZE: usize = 32;

/// The size (in bytes) of a P2TR script pubkey (`OP_1 OP_PUSHBYTES_32 <key>`).
pub const P2TR_SCRIPT_SIZE: usize = 34;

/// Depth of the bridge batch tree.
pub const BATCH_TREE_DEPTH: usize = 4;

/// Number of slots in the bridge batch tree.
pub const BATCH_TREE_SIZE: usize = 1 << BATCH_TREE_DEPTH;

/// Sentinel occupying every free slot of the batch tree.
pub const EMPTY_BATCH_ID: Buf32 = Buf32::zero();

/// Highest level a deposit aggregation node may reach.
pub const MAX_AGGREGATION_LEVEL: u8 = 8;

/// Highest level a withdrawal expansion node may reach.
pub const MAX_EXPANSION_LEVEL: u8 = 8;

/// Highest level at which an expansion node pays its leaves out directly.
pub const MAX_DISTRIBUTE_LEVEL: u8 = 2;

/// Maximum number of 32-byte hashes carried by a state commitment output.
pub const MAX_STATE_HASHES: usize = 2;

/// The x coordinate of the secp256k1 generator point `G`.
pub const GENERATOR_X: [u8; 32] = [
    0x79, 0xbe, 0x66, 0x7e, 0xf9, 0xdc, 0xbb, 0xac, 0x55, 0xa0, 0x62, 0x95, 0xce, 0x87, 0x0b, 0x07,
    0x02, 0x9b, 0xfc, 0xdb, 0x2d, 0xce, 0x28, 0xd9, 0x59, 0xf2, 0x81, 0x5b, 0x16, 0xf8, 0x17, 0x98,
];

lazy_static::lazy_static! {
    /// This is an unspendable pubkey, used as the internal key of every covenant output so that
    /// only the script path can be taken.
    ///
    /// Derived as `H + rG` following [BIP 341](https://github.com/bitcoin/bips/blob/master/bip-0341.mediawiki#constructing-and-spending-taproot-outputs)
    /// with `r = 0x82758434e13488368e0781c4a94019d3d6722f854d26c15d2d157acd1f464723`.
    pub static ref UNSPENDABLE_INTERNAL_KEY: XOnlyPublicKey =
        XOnlyPublicKey::from_str("2be4d02127fedf4c956f8e6d8248420b9af78746232315f72894f0b263c80e81").unwrap();

    /// The generator point as an x-only key.
    ///
    /// Its discrete log is `1`, so a signature with nonce `1` can be computed inside a script from
    /// the challenge alone. Covenants verify such signatures to bind the witness-supplied sighash
    /// preimage to the real transaction.
    pub static ref PREIMAGE_BINDING_PUBKEY: XOnlyPublicKey =
        XOnlyPublicKey::from_slice(&GENERATOR_X).unwrap();
}
