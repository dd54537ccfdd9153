//! Wall-clock abstraction used for credential issue and expiry checks.
//!
//! Credential lifetimes are measured against a [`ClockSource`] rather than
//! `SystemTime` directly so that expiry can be tested deterministically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Abstraction over the system clock for dependency injection.
///
/// The default implementation ([`SystemClock`]) delegates to `std::time::SystemTime`.
pub trait ClockSource: Send + Sync {
    /// Returns the current time as milliseconds since Unix epoch.
    fn now(&self) -> u64;

    /// Returns the current time as whole seconds since Unix epoch.
    ///
    /// JWT `iat`/`exp` claims use second granularity.
    fn now_secs(&self) -> u64 {
        self.now() / 1000
    }
}

/// Default clock source that reads the real system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now(&self) -> u64 {
        // A clock set before 1970 reads as the epoch; every credential then looks expired.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

/// Manually driven clock for tests and simulations.
///
/// Starts at the given instant and only moves when [`ManualClock::advance`]
/// or [`ManualClock::set`] is called.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    /// Creates a clock frozen at `millis` since Unix epoch.
    #[must_use]
    pub fn new(millis: u64) -> Self {
        Self {
            millis: AtomicU64::new(millis),
        }
    }

    /// Moves the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let delta = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.millis.fetch_add(delta, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute instant in milliseconds since Unix epoch.
    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl ClockSource for ManualClock {
    fn now(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_returns_nonzero() {
        let clock = SystemClock;
        assert!(clock.now() > 0);
        assert!(clock.now_secs() > 1_600_000_000);
    }

    #[test]
    fn manual_clock_only_moves_when_told() {
        let clock = ManualClock::new(1_700_000_000_000);
        assert_eq!(clock.now(), 1_700_000_000_000);
        assert_eq!(clock.now_secs(), 1_700_000_000);

        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now_secs(), 1_700_000_090);

        clock.set(5_000);
        assert_eq!(clock.now(), 5_000);
        assert_eq!(clock.now_secs(), 5);
    }
}
