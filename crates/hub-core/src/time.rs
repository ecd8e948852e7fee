//! Clock abstraction shared by every timed loop of the hub.
//!
//! Liveness scores, queue visibility and retry eligibility are all expressed
//! in wall-clock milliseconds since the Unix epoch, so that processes on
//! different hosts can compare them through the coordination store. The
//! `Clock` trait lets tests pin or advance that time deterministically.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, TimeZone, Utc};

/// Clock abstraction for time operations.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current instant for duration measurements.
    fn now(&self) -> Instant;

    /// Returns the current wall-clock time.
    fn now_system(&self) -> SystemTime;

    /// Sleeps for the specified duration.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Wall-clock time as a UTC timestamp.
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.now_system())
    }

    /// Wall-clock time in milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64 {
        system_time_to_millis(self.now_system())
    }
}

/// Converts a wall-clock time to milliseconds since the Unix epoch.
///
/// Times before the epoch clamp to zero.
pub fn system_time_to_millis(time: SystemTime) -> i64 {
    let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    i64::try_from(since_epoch.as_millis()).unwrap_or(i64::MAX)
}

/// Converts a duration to whole milliseconds, saturating at `i64::MAX`.
pub fn duration_to_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Converts epoch milliseconds back into a UTC timestamp.
pub fn millis_to_utc(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Production clock backed by the system clock and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock instance.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Manually driven clock.
///
/// Time only moves when `advance` or `set_millis` is called, or when a task
/// sleeps on it. Clones share the same time, so one handle can drive every
/// component of a test hub.
#[derive(Debug, Clone)]
pub struct TestClock {
    millis: Arc<AtomicI64>,
    base_instant: Instant,
    base_millis: i64,
}

impl TestClock {
    /// Creates a test clock starting at the current wall-clock time.
    pub fn new() -> Self {
        Self::at_millis(system_time_to_millis(SystemTime::now()))
    }

    /// Creates a test clock starting at `millis` since the Unix epoch.
    pub fn at_millis(millis: i64) -> Self {
        Self { millis: Arc::new(AtomicI64::new(millis)), base_instant: Instant::now(), base_millis: millis }
    }

    /// Moves the clock forward.
    pub fn advance(&self, duration: Duration) {
        self.millis.fetch_add(duration_to_millis(duration), Ordering::AcqRel);
    }

    /// Sets the wall-clock time. Moving backwards is allowed to simulate
    /// skew between hosts.
    pub fn set_millis(&self, millis: i64) {
        self.millis.store(millis, Ordering::Release);
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        let elapsed = self.millis.load(Ordering::Acquire).saturating_sub(self.base_millis).max(0);
        self.base_instant + Duration::from_millis(elapsed.unsigned_abs())
    }

    fn now_system(&self) -> SystemTime {
        let millis = self.millis.load(Ordering::Acquire).max(0);
        UNIX_EPOCH + Duration::from_millis(millis.unsigned_abs())
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }

    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances_wall_time() {
        let clock = TestClock::at_millis(1_000);

        clock.advance(Duration::from_millis(250));

        assert_eq!(clock.now_millis(), 1_250);
        assert_eq!(clock.now_utc().timestamp_millis(), 1_250);
    }

    #[test]
    fn clones_share_time() {
        let clock = TestClock::at_millis(0);
        let other = clock.clone();

        other.advance(Duration::from_secs(5));

        assert_eq!(clock.now_millis(), 5_000);
    }

    #[test]
    fn test_clock_may_move_backwards() {
        let clock = TestClock::at_millis(10_000);
        clock.set_millis(9_000);
        assert_eq!(clock.now_millis(), 9_000);
    }

    #[test]
    fn millis_round_trip_through_utc() {
        assert_eq!(millis_to_utc(1_700_000_000_123).timestamp_millis(), 1_700_000_000_123);
        assert_eq!(system_time_to_millis(UNIX_EPOCH), 0);
    }

    #[tokio::test]
    async fn sleeping_advances_test_clock() {
        let clock = TestClock::at_millis(0);

        clock.sleep(Duration::from_millis(40)).await;

        assert_eq!(clock.now_millis(), 40);
    }
}
