//! Host-supplied time.
//!
//! The engine never calls `Utc::now()`. Each entry point receives a
//! [`Clock`] from the host runtime, which is what makes staleness checks
//! reproducible in tests and replays.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// The instant and accounting epoch an entry point executes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clock {
    /// Current timestamp.
    pub now: DateTime<Utc>,
    /// Current accounting epoch. Loss budgets reset when this advances.
    pub epoch: u64,
}

impl Clock {
    /// Creates a clock at the given instant and epoch.
    pub fn new(now: DateTime<Utc>, epoch: u64) -> Self {
        Self { now, epoch }
    }

    /// Creates a clock from milliseconds since the Unix epoch. Out-of-range
    /// values clamp to the Unix epoch itself.
    pub fn from_millis(ms: i64, epoch: u64) -> Self {
        let now = Utc
            .timestamp_millis_opt(ms)
            .single()
            .unwrap_or_default();
        Self { now, epoch }
    }

    /// Returns a clock `ms` milliseconds later in the same epoch.
    pub fn advanced_ms(&self, ms: i64) -> Self {
        Self {
            now: self.now + Duration::milliseconds(ms),
            epoch: self.epoch,
        }
    }

    /// Returns a clock at the same instant in the next epoch.
    pub fn next_epoch(&self) -> Self {
        Self {
            now: self.now,
            epoch: self.epoch.saturating_add(1),
        }
    }
}

/// Age of `then` as seen from `now`. Timestamps from the future count as
/// age zero rather than a negative age.
pub fn age(now: DateTime<Utc>, then: DateTime<Utc>) -> Duration {
    let elapsed = now.signed_duration_since(then);
    if elapsed < Duration::zero() {
        Duration::zero()
    } else {
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advancing_keeps_epoch() {
        let clock = Clock::from_millis(1_000, 7);
        let later = clock.advanced_ms(500);
        assert_eq!(later.epoch, 7);
        assert_eq!(later.now.timestamp_millis(), 1_500);
        assert_eq!(clock.next_epoch().epoch, 8);
    }

    #[test]
    fn future_timestamps_have_zero_age() {
        let clock = Clock::from_millis(1_000, 0);
        let future = clock.advanced_ms(10).now;
        assert_eq!(age(clock.now, future), Duration::zero());
        assert_eq!(age(future, clock.now), Duration::milliseconds(10));
    }
}
