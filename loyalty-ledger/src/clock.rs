//! Injectable time source
//!
//! Entry timestamps, expiry checks and summary freshness all read time
//! through [`Clock`], so tests can move time forward without sleeping.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::sync::Arc;

/// Source of "now"
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current instant
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time (production)
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven time (tests, simulations)
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<RwLock<DateTime<Utc>>>,
}

impl ManualClock {
    /// Start at `start`
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Arc::new(RwLock::new(start)),
        }
    }

    /// Move forward by `by`
    pub fn advance(&self, by: Duration) {
        let mut current = self.current.write();
        *current += by;
    }

    /// Jump to `to`
    pub fn set(&self, to: DateTime<Utc>) {
        *self.current.write() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances_shared_state() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        let shared = clock.clone();

        clock.advance(Duration::days(2));
        assert_eq!(shared.now(), start + Duration::days(2));

        shared.set(start);
        assert_eq!(clock.now(), start);
    }
}
