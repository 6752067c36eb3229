use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// An instant as signed nanoseconds since the Unix epoch.
///
/// Kept as a single integer so that stores which only compare numbers can
/// evaluate liveness conditions directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// The instant Release writes into `expire_time`.
    pub const EPOCH: Timestamp = Timestamp(0);

    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    pub const fn as_nanos(self) -> i64 {
        self.0
    }

    /// `self + duration`, clamped at the largest representable instant.
    #[must_use]
    pub fn saturating_add(self, duration: Duration) -> Self {
        let nanos = i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX);
        Self(self.0.saturating_add(nanos))
    }

    pub fn to_datetime(self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.0)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        // Outside roughly 1677..2262 the nanosecond count does not fit.
        let nanos = dt.timestamp_nanos_opt().unwrap_or(if dt.timestamp() < 0 {
            i64::MIN
        } else {
            i64::MAX
        });
        Self(nanos)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().to_rfc3339())
    }
}

/// Source of "now" for the lease protocol.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Timestamp;
}

/// The process's wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::from(Utc::now())
    }
}

/// A clock that only moves when told to. Used to simulate lease expiry.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            nanos: AtomicI64::new(start.as_nanos()),
        }
    }

    pub fn set(&self, to: Timestamp) {
        self.nanos.store(to.as_nanos(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let by = i64::try_from(by.as_nanos()).unwrap_or(i64::MAX);
        // fetch_update never fails when the closure always returns Some
        let _ = self
            .nanos
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_add(by)));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.nanos.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saturating_add() {
        let t = Timestamp::from_nanos(1_000);
        assert_eq!(t.saturating_add(Duration::from_nanos(500)).as_nanos(), 1_500);
        assert_eq!(
            t.saturating_add(Duration::from_secs(30)).as_nanos(),
            1_000 + 30_000_000_000
        );

        let near_max = Timestamp::from_nanos(i64::MAX - 10);
        assert_eq!(near_max.saturating_add(Duration::from_secs(1)).as_nanos(), i64::MAX);
        assert_eq!(Timestamp::EPOCH.saturating_add(Duration::MAX).as_nanos(), i64::MAX);
    }

    #[test]
    fn test_datetime_conversion() {
        let dt = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let ts = Timestamp::from(dt);
        assert_eq!(ts.to_datetime(), dt);
        assert_eq!(Timestamp::EPOCH.to_string(), "1970-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(Timestamp::from_nanos(10));
        assert_eq!(clock.now(), Timestamp::from_nanos(10));

        clock.advance(Duration::from_nanos(5));
        assert_eq!(clock.now(), Timestamp::from_nanos(15));

        clock.set(Timestamp::EPOCH);
        assert_eq!(clock.now(), Timestamp::EPOCH);
    }

    #[test]
    fn test_system_clock_moves_forward() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
        assert!(a > Timestamp::EPOCH);
    }
}
