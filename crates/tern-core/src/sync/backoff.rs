//! Retry delay after a failed sync pass

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with ±25% jitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max_exponent: u32,
}

impl Backoff {
    pub const fn new(base: Duration, max_exponent: u32) -> Self {
        Self { base, max_exponent }
    }

    /// `base * 2^(attempt - 1)`, capped at `base * 2^max_exponent`
    pub fn nominal(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(self.max_exponent);
        self.base.saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX))
    }

    /// Nominal delay for `attempt` with jitter applied
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = u64::try_from(self.nominal(attempt).as_millis()).unwrap_or(u64::MAX);
        let jitter = nominal / 4;
        if jitter == 0 {
            return Duration::from_millis(nominal);
        }
        let low = nominal - jitter;
        let high = nominal.saturating_add(jitter);
        Duration::from_millis(rand::thread_rng().gen_range(low..=high))
    }
}
