//! Retry policy shared by queue drains and subscription reconnects.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff parameterized by base delay, multiplier, cap and
/// retry ceiling.
///
/// The delay before retry `n` (1-based count of failures so far) is
/// `base * multiplier^(n-1)`, clamped to `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Delay after the first failure, in milliseconds
    pub base_ms: u64,
    pub multiplier: u32,
    /// Upper bound for a single delay, in milliseconds
    pub cap_ms: u64,
    /// Number of failed attempts after which a mutation is dead-lettered
    pub ceiling: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_ms: 500,
            multiplier: 2,
            cap_ms: 60_000,
            ceiling: 5,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_ms: u64, multiplier: u32, cap_ms: u64, ceiling: u32) -> Self {
        Self {
            base_ms,
            multiplier: multiplier.max(1),
            cap_ms,
            ceiling,
        }
    }

    /// Backoff in milliseconds after `attempts` consecutive failures.
    pub fn delay_ms(&self, attempts: u32) -> u64 {
        if attempts == 0 {
            return 0;
        }
        let factor = (self.multiplier as u64)
            .checked_pow(attempts - 1)
            .unwrap_or(u64::MAX);
        self.base_ms.saturating_mul(factor).min(self.cap_ms)
    }

    pub fn delay(&self, attempts: u32) -> Duration {
        Duration::from_millis(self.delay_ms(attempts))
    }

    /// Whether `attempts` failures have used up the retry budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.ceiling
    }
}
