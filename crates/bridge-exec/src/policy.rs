//! Thresholds deciding when the operator moves a batch forward.

use catbridge_primitives::constants::{MAX_AGGREGATION_LEVEL, MAX_DISTRIBUTE_LEVEL};
use serde::{Deserialize, Serialize};

/// When observed deposits are closed into a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositPolicy {
    /// Number of deposits a full batch holds; a power of two.
    pub batch_size: usize,

    /// Age in seconds after which the oldest waiting deposit forces a smaller batch.
    pub max_age_secs: u64,
}

impl DepositPolicy {
    /// Checks the batch size can be aggregated into a single root.
    pub fn validate(&self) -> Result<(), String> {
        if !self.batch_size.is_power_of_two() {
            return Err(format!("batch size {} is not a power of two", self.batch_size));
        }
        if self.batch_size > 1 << MAX_AGGREGATION_LEVEL {
            return Err(format!(
                "batch size {} exceeds {}",
                self.batch_size,
                1usize << MAX_AGGREGATION_LEVEL
            ));
        }
        Ok(())
    }

    /// How many of `count` waiting deposits to batch now, the oldest being `oldest_age` seconds
    /// old.
    ///
    /// A full batch is taken as soon as there is one. Once the oldest deposit is too old, the
    /// largest power of two not exceeding `count` is taken instead.
    pub fn ready(&self, count: usize, oldest_age: u64) -> Option<usize> {
        if count == 0 {
            return None;
        }
        if count >= self.batch_size {
            return Some(self.batch_size);
        }
        if oldest_age >= self.max_age_secs {
            return Some(1 << count.ilog2());
        }
        None
    }
}

impl Default for DepositPolicy {
    fn default() -> Self {
        Self {
            batch_size: 4,
            max_age_secs: 3_600,
        }
    }
}

/// How a withdrawal batch is split before paying out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalPolicy {
    /// Expander nodes at or below this level are distributed, higher ones expanded.
    pub distribute_threshold: u8,
}

impl WithdrawalPolicy {
    /// Checks the threshold is one the expander can distribute at.
    pub fn validate(&self) -> Result<(), String> {
        if self.distribute_threshold > MAX_DISTRIBUTE_LEVEL {
            return Err(format!(
                "distribute threshold {} exceeds {MAX_DISTRIBUTE_LEVEL}",
                self.distribute_threshold
            ));
        }
        Ok(())
    }

    /// Whether a node at `level` is paid out rather than split further.
    pub fn distributes(&self, level: u8) -> bool {
        level <= self.distribute_threshold
    }
}

impl Default for WithdrawalPolicy {
    fn default() -> Self {
        Self {
            distribute_threshold: MAX_DISTRIBUTE_LEVEL,
        }
    }
}
