//! Minimum-interval run throttle.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Outcome of a throttle check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    Proceed,
    TooSoon { retry_after: Duration },
}

/// Rejects runs that start too soon after the ledger was last persisted.
///
/// The check is advisory: two runs that both start before either persists
/// are not told apart.
#[derive(Debug, Clone, Copy)]
pub struct RunThrottle {
    minimum_interval: Duration,
}

impl RunThrottle {
    /// A zero interval disables the throttle.
    pub fn new(minimum_interval: Duration) -> Self {
        Self { minimum_interval }
    }

    pub fn minimum_interval(&self) -> Duration {
        self.minimum_interval
    }

    pub fn check(&self, last_persisted_at: DateTime<Utc>, now: DateTime<Utc>) -> ThrottleDecision {
        if self.minimum_interval.is_zero() {
            return ThrottleDecision::Proceed;
        }

        // A timestamp in the future counts as "just now"
        let elapsed = (now - last_persisted_at).to_std().unwrap_or(Duration::ZERO);

        if elapsed < self.minimum_interval {
            ThrottleDecision::TooSoon {
                retry_after: self.minimum_interval - elapsed,
            }
        } else {
            ThrottleDecision::Proceed
        }
    }
}
