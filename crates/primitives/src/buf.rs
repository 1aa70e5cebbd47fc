//! Fixed-size byte buffers.

use std::{fmt, str};

use arbitrary::Arbitrary;
use bitcoin::{
    hashes::{sha256, Hash},
    Txid,
};
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::PrimitivesError;

/// 32-byte buf, used for hashes, batch ids and txids in internal byte order.
#[derive(
    Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, BorshSerialize, BorshDeserialize,
)]
pub struct Buf32(pub [u8; 32]);

impl Buf32 {
    /// The all-zero buffer.
    pub const fn zero() -> Self {
        Self([0; 32])
    }

    /// Returns `true` if every byte is zero.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Borrows the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Copies a 32-byte slice into a new buffer.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, PrimitivesError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| PrimitivesError::InvalidLength {
                expected: 32,
                got: bytes.len(),
            })?;
        Ok(Self(arr))
    }
}

impl From<[u8; 32]> for Buf32 {
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}

impl From<Buf32> for [u8; 32] {
    fn from(value: Buf32) -> Self {
        value.0
    }
}

impl From<sha256::Hash> for Buf32 {
    fn from(value: sha256::Hash) -> Self {
        Self(value.to_byte_array())
    }
}

impl From<Txid> for Buf32 {
    fn from(value: Txid) -> Self {
        Self(value.to_byte_array())
    }
}

impl From<Buf32> for Txid {
    fn from(value: Buf32) -> Self {
        Txid::from_byte_array(value.0)
    }
}

impl AsRef<[u8]> for Buf32 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Buf32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = [0; 64];
        hex::encode_to_slice(self.0, &mut buf).expect("buf: enc hex");
        f.write_str(str::from_utf8(&buf).expect("buf: hex is utf8"))
    }
}

impl fmt::Display for Buf32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl str::FromStr for Buf32 {
    type Err = PrimitivesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| PrimitivesError::Hex(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for Buf32 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Buf32 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as Deserialize>::deserialize(deserializer)?;
        s.parse::<Buf32>().map_err(de::Error::custom)
    }
}

impl<'a> Arbitrary<'a> for Buf32 {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        let mut array = [0u8; 32];
        u.fill_buffer(&mut array)?;
        Ok(Buf32(array))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip_through_serde() {
        let buf = Buf32([0xab; 32]);
        let json = serde_json::to_string(&buf).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(32)));

        let parsed: Buf32 = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, buf);
    }

    #[test]
    fn test_rejects_wrong_length() {
        let err = Buf32::from_slice(&[0u8; 31]).unwrap_err();
        assert!(matches!(
            err,
            PrimitivesError::InvalidLength {
                expected: 32,
                got: 31
            }
        ));
    }

    #[test]
    fn test_txid_keeps_internal_byte_order() {
        let mut bytes = [0u8; 32];
        bytes[0] = 1;
        let txid = Txid::from_byte_array(bytes);
        assert_eq!(Buf32::from(txid).0, bytes);
    }
}
