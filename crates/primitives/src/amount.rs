//! Amount and level encodings shared by the covenant state hashes and the contract outputs.

use std::{fmt, iter::Sum, ops::Add};

use bitcoin::Amount;
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::{
    constants::MAX_SCRIPT_AMOUNT,
    errors::{PrimitivesError, PrimitivesResult},
};

/// Encodes an amount as the 8-byte little-endian value used in outputs and state hashes.
///
/// Only amounts that fit a positive 32-bit script number are accepted, since covenant scripts
/// add amounts with `OP_ADD`.
pub fn encode_amount(amt: u64) -> PrimitivesResult<[u8; 8]> {
    if amt > MAX_SCRIPT_AMOUNT {
        return Err(PrimitivesError::AmountOutOfRange(amt));
    }

    Ok(amt.to_le_bytes())
}

/// Encodes a tree level as the single byte prefixed to every level-separated hash.
pub fn encode_level(level: u8) -> [u8; 1] {
    [level]
}

/// A bitcoin amount in sats.
#[derive(
    Debug,
    Copy,
    Clone,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    BorshSerialize,
    BorshDeserialize,
)]
pub struct BitcoinAmount(u64);

impl BitcoinAmount {
    /// The zero amount.
    pub const ZERO: BitcoinAmount = Self(0);

    /// The number of sats in 1 bitcoin.
    pub const SATS_FACTOR: u64 = 100_000_000;

    /// Create a [`BitcoinAmount`] with the given number of sats.
    pub const fn from_sat(value: u64) -> Self {
        Self(value)
    }

    /// Get the number of sats in this [`BitcoinAmount`].
    pub const fn to_sat(&self) -> u64 {
        self.0
    }

    /// Returns the script-safe encoding of this amount.
    pub fn encode(&self) -> PrimitivesResult<[u8; 8]> {
        encode_amount(self.0)
    }

    /// Checked addition that also enforces the script-safe range.
    pub fn checked_add_script(self, rhs: Self) -> PrimitivesResult<Self> {
        let sum = self
            .0
            .checked_add(rhs.0)
            .ok_or(PrimitivesError::AmountOutOfRange(u64::MAX))?;
        encode_amount(sum)?;
        Ok(Self(sum))
    }

    /// Checked subtraction.
    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Self)
    }
}

impl fmt::Display for BitcoinAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Amount> for BitcoinAmount {
    fn from(value: Amount) -> Self {
        Self::from_sat(value.to_sat())
    }
}

impl From<BitcoinAmount> for Amount {
    fn from(value: BitcoinAmount) -> Self {
        Self::from_sat(value.to_sat())
    }
}

impl Add for BitcoinAmount {
    type Output = BitcoinAmount;

    fn add(self, rhs: Self) -> Self::Output {
        Self::from_sat(self.to_sat() + rhs.to_sat())
    }
}

impl Sum for BitcoinAmount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        Self::from_sat(iter.map(|amt| amt.to_sat()).sum())
    }
}
