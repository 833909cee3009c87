//! Bounded exponential backoff shared by the agent client pool's retry policy and the
//! delivery dispatcher's retry policy, so the shape (base, cap, multiplier) is defined once.

use std::time::Duration;

/// A bounded exponential backoff schedule: `base * multiplier^(attempt - 1)`, capped at `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    multiplier: u32,
}

impl Backoff {
    /// Builds a backoff schedule. `attempt` is 1-indexed in [`Backoff::delay_for`].
    #[must_use]
    pub fn new(base: Duration, cap: Duration, multiplier: u32) -> Self {
        Self {
            base,
            cap,
            multiplier,
        }
    }

    /// The agent client pool's retry shape: base 1s doubling, capped at 30s.
    #[must_use]
    pub fn agent_retry() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 2)
    }

    /// The delivery dispatcher's retry shape: base 10s doubling, capped at 5 minutes.
    #[must_use]
    pub fn delivery_retry() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(5 * 60), 2)
    }

    /// Delay before the given 1-indexed attempt, saturating at `cap` rather than overflowing.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.saturating_sub(1);
        let Some(multiplier) = self.multiplier.checked_pow(attempt) else {
            return self.cap;
        };
        let Some(scaled) = self.base.checked_mul(multiplier) else {
            return self.cap;
        };
        scaled.min(self.cap)
    }
}
