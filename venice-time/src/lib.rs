//! A small time abstraction that lets the ingestion pipeline be driven by a
//! mock clock in tests instead of the wall clock.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(missing_copy_implementations, missing_debug_implementations)]

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// An instant in time, represented as nanoseconds since the Unix epoch.
///
/// This is deliberately a thin wrapper: the pipeline never needs calendar
/// arithmetic, only monotonic comparisons and duration deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(i64);

impl Time {
    /// Construct a `Time` from nanoseconds since the Unix epoch.
    pub fn from_timestamp_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    /// Construct a `Time` from milliseconds since the Unix epoch.
    pub fn from_timestamp_millis(millis: i64) -> Self {
        Self(millis.saturating_mul(1_000_000))
    }

    /// Nanoseconds since the Unix epoch.
    pub fn timestamp_nanos(&self) -> i64 {
        self.0
    }

    /// Milliseconds since the Unix epoch.
    pub fn timestamp_millis(&self) -> i64 {
        self.0 / 1_000_000
    }

    /// Duration elapsed since `earlier`, or `None` if `earlier` is after `self`.
    pub fn checked_duration_since(&self, earlier: Time) -> Option<Duration> {
        let delta = self.0 - earlier.0;
        if delta < 0 {
            None
        } else {
            Some(Duration::from_nanos(delta as u64))
        }
    }

    /// The larger of two timestamps. Used to tolerate producer clock drift
    /// when stamping heartbeats.
    pub fn max(self, other: Time) -> Time {
        if self.0 >= other.0 {
            self
        } else {
            other
        }
    }
}

/// Anything that can hand out the current time.
///
/// Production code uses [`SystemProvider`]; tests use [`MockProvider`] so
/// that age/staleness thresholds can be exercised deterministically.
pub trait TimeProvider: Debug + Send + Sync + 'static {
    /// Returns the current time.
    fn now(&self) -> Time;
}

/// A [`TimeProvider`] backed by the wall clock.
#[derive(Debug, Default, Copy, Clone)]
pub struct SystemProvider {}

impl SystemProvider {
    /// Create a new `SystemProvider`.
    pub fn new() -> Self {
        Self {}
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> Time {
        let since_epoch = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Time::from_timestamp_nanos(since_epoch.as_nanos() as i64)
    }
}

/// A [`TimeProvider`] that only moves when told to. Used by tests that need
/// to assert on age- or staleness-based behavior without sleeping.
#[derive(Debug)]
pub struct MockProvider {
    now: Mutex<Time>,
}

impl MockProvider {
    /// Create a new `MockProvider` starting at `start`.
    pub fn new(start: Time) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Advance the clock by `duration` and return the new time.
    pub fn inc(&self, duration: Duration) -> Time {
        let mut now = self.now.lock();
        *now = Time::from_timestamp_nanos(now.0 + duration.as_nanos() as i64);
        *now
    }

    /// Set the clock to an explicit time.
    pub fn set(&self, time: Time) {
        *self.now.lock() = time;
    }
}

impl TimeProvider for MockProvider {
    fn now(&self) -> Time {
        *self.now.lock()
    }
}

/// Convenience alias for the common case of sharing a time provider across
/// tasks.
pub type SharedTimeProvider = Arc<dyn TimeProvider>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_provider_advances() {
        let t0 = Time::from_timestamp_nanos(0);
        let provider = MockProvider::new(t0);
        assert_eq!(provider.now(), t0);
        provider.inc(Duration::from_secs(1));
        assert_eq!(provider.now(), Time::from_timestamp_nanos(1_000_000_000));
    }

    #[test]
    fn duration_since_is_none_for_the_future() {
        let earlier = Time::from_timestamp_nanos(10);
        let later = Time::from_timestamp_nanos(5);
        assert!(later.checked_duration_since(earlier).is_none());
    }

    #[test]
    fn max_picks_the_later_timestamp() {
        let a = Time::from_timestamp_nanos(5);
        let b = Time::from_timestamp_nanos(9);
        assert_eq!(a.max(b), b);
        assert_eq!(b.max(a), b);
    }
}
