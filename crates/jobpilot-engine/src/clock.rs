//! Engine clock.
//!
//! Wall-clock timestamps are derived from a fixed base plus the tokio
//! monotonic clock. Under `tokio::time::pause` the monotonic clock advances
//! virtually, so every component that takes its `now` from here stays
//! consistent with the runtime's notion of time — both in production and in
//! paused-time tests.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Shared engine clock; cheap to clone.
#[derive(Debug, Clone)]
pub struct EngineClock {
    base: DateTime<Utc>,
    start: Instant,
}

impl EngineClock {
    /// Creates a clock anchored at the current wall time.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: Utc::now(),
            start: Instant::now(),
        }
    }

    /// Creates a clock anchored at an explicit base, for tests.
    #[must_use]
    pub fn anchored(base: DateTime<Utc>) -> Self {
        Self {
            base,
            start: Instant::now(),
        }
    }

    /// The current time: base plus monotonic elapsed.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.base + chrono::Duration::from_std(self.start.elapsed()).unwrap_or_default()
    }
}

impl Default for EngineClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_clock_follows_virtual_time() {
        let clock = EngineClock::new();
        let t0 = clock.now();
        tokio::time::sleep(std::time::Duration::from_secs(90)).await;
        let t1 = clock.now();
        assert!((t1 - t0).num_seconds() >= 90);
    }
}
