//! Shared fixtures for the bridge crates' tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use arbitrary::{Arbitrary, Unstructured};
use catbridge_primitives::buf::Buf32;
use rand::{rngs::OsRng, RngCore};

pub mod bitcoin;
pub mod chain;

/// Bytes of entropy drawn per generator.
const ENTROPY_POOL_LEN: usize = 64 * 1024;

/// Produces random values of any [`Arbitrary`] type from a pool of OS entropy.
///
/// The read cursor is atomic so one generator can be shared by reference between fixtures.
pub struct ArbitraryGenerator {
    pool: Vec<u8>,
    cursor: AtomicUsize,
}

impl Default for ArbitraryGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ArbitraryGenerator {
    pub fn new() -> Self {
        Self::with_pool_len(ENTROPY_POOL_LEN)
    }

    pub fn with_pool_len(len: usize) -> Self {
        let mut pool = vec![0; len];
        OsRng.fill_bytes(&mut pool);
        Self {
            pool,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Draws the next value, advancing the cursor by the bytes consumed.
    ///
    /// # Panics
    ///
    /// If the pool runs dry.
    pub fn generate<'a, T: Arbitrary<'a> + Clone>(&'a self) -> T {
        let start = self.cursor.load(Ordering::Relaxed);
        let mut input = Unstructured::new(&self.pool[start..]);
        let remaining = input.len();
        let value = T::arbitrary(&mut input).expect("entropy pool exhausted");
        self.cursor
            .store(start + remaining - input.len(), Ordering::Relaxed);
        value
    }
}

/// A fresh random 32-byte value, e.g. an L2 address or a batch id.
pub fn random_buf32() -> Buf32 {
    ArbitraryGenerator::new().generate()
}
