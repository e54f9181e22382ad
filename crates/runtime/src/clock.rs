//! Time source abstraction for the control plane.
//!
//! Rate windows, TTL eviction and token-cache expiry all measure elapsed
//! time in epoch seconds. Production code uses [`SystemClock`]; tests drive
//! a [`ManualClock`] so sliding windows and TTLs can be exercised without
//! sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, TimeZone, Utc};

/// Source of "now" for every time-sensitive component.
pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch, with sub-second precision.
    fn epoch_secs(&self) -> f64;

    /// Wall-clock timestamp for records and events.
    fn now_utc(&self) -> DateTime<Utc> {
        let secs = self.epoch_secs();
        let millis = (secs * 1000.0) as i64;
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// Clock backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn epoch_secs(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually-advanced clock for deterministic tests.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    /// Create a clock starting at the given epoch-second offset.
    pub fn starting_at(epoch_secs: u64) -> Self {
        Self {
            millis: AtomicU64::new(epoch_secs * 1000),
        }
    }

    /// Advance the clock by the given duration.
    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        // An arbitrary fixed origin keeps test output stable.
        Self::starting_at(1_700_000_000)
    }
}

impl Clock for ManualClock {
    fn epoch_secs(&self) -> f64 {
        self.millis.load(Ordering::SeqCst) as f64 / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::starting_at(100);
        assert_eq!(clock.epoch_secs(), 100.0);

        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.epoch_secs(), 101.5);
    }

    #[test]
    fn manual_clock_utc_tracks_epoch() {
        let clock = ManualClock::starting_at(1_700_000_000);
        assert_eq!(clock.now_utc().timestamp(), 1_700_000_000);
    }

    #[test]
    fn system_clock_is_monotonic_enough() {
        let clock = SystemClock;
        let a = clock.epoch_secs();
        let b = clock.epoch_secs();
        assert!(b >= a);
    }
}
