//! Wall-clock timestamp type carried in lease messages.

use std::fmt;
use std::ops::Add;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// A `(seconds, nanoseconds)` wall-clock instant since the Unix epoch.
///
/// Lease expirations are absolute wall-clock deadlines shared across
/// replicas, so they travel on the wire and must compare across machines;
/// clock drift beyond the configured allowance is detected by comparing a
/// peer's stamp against the local clock.
#[derive(
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    Encode,
    Decode,
)]
pub struct UTime {
    sec: u64,
    nsec: u32,
}

impl UTime {
    /// The zero timestamp, used as the null/cleared value.
    pub const ZERO: UTime = UTime { sec: 0, nsec: 0 };

    /// Creates a timestamp from raw parts, normalizing nanosecond overflow.
    pub fn new(sec: u64, nsec: u32) -> Self {
        UTime {
            sec: sec + (nsec / 1_000_000_000) as u64,
            nsec: nsec % 1_000_000_000,
        }
    }

    /// Reads the current wall clock.
    pub fn now() -> Self {
        // system clock predating the epoch would be a badly broken host;
        // treat it as the zero timestamp rather than panicking
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        UTime {
            sec: since_epoch.as_secs(),
            nsec: since_epoch.subsec_nanos(),
        }
    }

    /// True if this is the null timestamp.
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.sec == 0 && self.nsec == 0
    }

    /// Saturating difference `self - other` as a `Duration`; zero if `other`
    /// is not earlier than `self`.
    pub fn saturating_since(&self, other: UTime) -> Duration {
        if *self <= other {
            return Duration::ZERO;
        }
        let (mut sec, mut nsec) = (self.sec - other.sec, self.nsec);
        if nsec < other.nsec {
            sec -= 1;
            nsec += 1_000_000_000;
        }
        Duration::new(sec, nsec - other.nsec)
    }
}

impl Add<Duration> for UTime {
    type Output = UTime;

    fn add(self, dur: Duration) -> UTime {
        UTime::new(
            self.sec + dur.as_secs(),
            self.nsec + dur.subsec_nanos(),
        )
    }
}

impl fmt::Display for UTime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{:06}", self.sec, self.nsec / 1000)
    }
}

#[cfg(test)]
mod utime_tests {
    use super::*;

    #[test]
    fn utime_ordering() {
        let t0 = UTime::new(100, 500);
        let t1 = UTime::new(100, 501);
        let t2 = UTime::new(101, 0);
        assert!(t0 < t1);
        assert!(t1 < t2);
        assert!(UTime::ZERO < t0);
        assert!(UTime::ZERO.is_zero());
        assert!(!t0.is_zero());
    }

    #[test]
    fn utime_add_normalizes() {
        let t = UTime::new(7, 999_999_999) + Duration::from_nanos(2);
        assert_eq!(t, UTime::new(8, 1));
    }

    #[test]
    fn utime_saturating_since() {
        let t0 = UTime::new(10, 200);
        let t1 = UTime::new(12, 100);
        assert_eq!(
            t1.saturating_since(t0),
            Duration::new(1, 999_999_900)
        );
        assert_eq!(t0.saturating_since(t1), Duration::ZERO);
        assert_eq!(t0.saturating_since(t0), Duration::ZERO);
    }

    #[test]
    fn utime_now_advances() {
        let t0 = UTime::now();
        assert!(!t0.is_zero());
        assert!(t0 + Duration::from_secs(1) > t0);
    }
}
