//! Constants related to covenant transactions.

use bitcoin::{Amount, Sequence};

/// Most inputs a covenant transaction may spend.
///
/// Every input contributes to the preimage each covenant input has to carry, and the script only
/// has room for so many.
pub const MAX_INPUTS: usize = 6;

/// Most outputs a covenant transaction may create, change included.
pub const MAX_OUTPUTS: usize = 6;

/// Sequence the trailing input starts grinding from: relative lock-time disabled.
pub const GRIND_SEQUENCE_START: u32 = 0x8000_0000;

/// Upper bound on the sequences tried while searching for a bindable preimage.
///
/// Each covenant input succeeds with probability ~1/2 per attempt, so this is never reached in
/// practice.
pub const MAX_GRIND_ATTEMPTS: u32 = 1 << 16;

/// Sequence of every input other than the trailing one.
pub const DEFAULT_SEQUENCE: Sequence = Sequence::ENABLE_RBF_NO_LOCKTIME;

/// Dust limit of a P2TR output.
///
/// Change below this amount is left to the miner instead.
pub const P2TR_DUST_LIMIT: Amount = Amount::from_sat(330);

/// Size of a key-path schnorr signature with the default sighash type.
pub const KEY_SPEND_SIGNATURE_SIZE: usize = 64;
