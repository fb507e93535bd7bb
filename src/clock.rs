//! Sources of time for lease expiry.
//!
//! Lease deadlines are stored as wall-clock times so other servers
//! can read them, but a holder judges its own lease with a monotonic
//! [`Instant`] so a wall-clock jump can't extend it.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use chrono::DateTime;
use chrono::Utc;

pub trait Clock: Send + Sync {
    /// Wall-clock time written to and compared with stored deadlines.
    fn now(&self) -> DateTime<Utc>;

    /// Monotonic time for local validity checks.
    fn instant(&self) -> Instant;
}

/// Use the current system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }
}

/// Simulate time for tests. Only moves when told to.
///
/// Clones share the same "now", so several lease managers in a test
/// observe the same timeline.
#[derive(Debug, Clone)]
pub struct TestingClock {
    inner: Arc<Mutex<TestingNow>>,
}

#[derive(Debug)]
struct TestingNow {
    wall: DateTime<Utc>,
    base: Instant,
    elapsed: Duration,
}

impl TestingClock {
    pub fn new(start_at: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TestingNow {
                wall: start_at,
                base: Instant::now(),
                elapsed: Duration::ZERO,
            })),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        now.elapsed += by;
        if let Ok(by) = chrono::Duration::from_std(by) {
            now.wall += by;
        }
    }

    /// Move only the wall clock, as a badly synced server would.
    pub fn skew_wall(&self, by: chrono::Duration) {
        let mut now = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        now.wall += by;
    }
}

impl Clock for TestingClock {
    fn now(&self) -> DateTime<Utc> {
        self.inner.lock().unwrap_or_else(|err| err.into_inner()).wall
    }

    fn instant(&self) -> Instant {
        let now = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        now.base + now.elapsed
    }
}

#[test]
fn testing_clock_advances_both() {
    use chrono::TimeZone;

    let clock = TestingClock::new(Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap());
    let before = clock.instant();
    clock.advance(Duration::from_secs(3));

    assert_eq!(
        clock.now(),
        Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 3).unwrap()
    );
    assert_eq!(clock.instant() - before, Duration::from_secs(3));
}

#[test]
fn skew_leaves_monotonic_alone() {
    use chrono::TimeZone;

    let clock = TestingClock::new(Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap());
    let before = clock.instant();
    clock.skew_wall(chrono::Duration::seconds(-30));

    assert_eq!(
        clock.now(),
        Utc.with_ymd_and_hms(2021, 12, 31, 23, 59, 30).unwrap()
    );
    assert_eq!(clock.instant(), before);
}
