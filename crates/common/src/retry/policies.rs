use super::Backoff;

/// Upper bound on a single retry delay.
pub const MAX_DELAY_MS: u64 = 60_000;

/// Delay growing by a rational factor `num / den` after every attempt, capped at
/// [`MAX_DELAY_MS`].
///
/// ```
/// use catbridge_common::retry::{policies::ExponentialBackoff, Backoff};
///
/// let backoff = ExponentialBackoff::new(1000, 3, 2);
/// assert_eq!(backoff.next_delay_ms(1000), 1500);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    base_delay_ms: u64,
    num: u64,
    den: u64,
}

impl ExponentialBackoff {
    /// A zero `den` is treated as `1`.
    pub fn new(base_delay_ms: u64, num: u64, den: u64) -> Self {
        Self {
            base_delay_ms,
            num,
            den: den.max(1),
        }
    }
}

impl Default for ExponentialBackoff {
    /// 1.5s, growing by half each attempt.
    fn default() -> Self {
        Self::new(1_500, 3, 2)
    }
}

impl Backoff for ExponentialBackoff {
    fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    fn next_delay_ms(&self, curr_delay_ms: u64) -> u64 {
        (curr_delay_ms.saturating_mul(self.num) / self.den).min(MAX_DELAY_MS)
    }
}
