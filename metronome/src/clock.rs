use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;
use std::time::Instant;

/// How a [`Clock`] sources its readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    /// Derived from a monotonic counter; high resolution, drifts from NTP.
    Fast,
    /// The OS wall clock, roughly 100 ns granularity.
    Standard,
    /// The OS's NTP-disciplined time source, microsecond granularity or better.
    Synchronized,
}

/// Source of "now" for a scheduler. This module is the only place the
/// process clock is read; everything else asks the engine's clock, which
/// lets tests drive the whole scheduler with virtual time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn precision(&self) -> Precision;
}

/// The OS wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardClock;

impl Clock for StandardClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn precision(&self) -> Precision {
        Precision::Standard
    }
}

/// The OS's NTP-disciplined time source.
///
/// On the platforms this crate targets, the wall clock read by
/// [`StandardClock`] is already the NTP-adjusted `CLOCK_REALTIME` source,
/// so the fallback the contract allows is always taken and the two report
/// the same readings at different advertised precisions.
#[derive(Debug, Default, Clone, Copy)]
pub struct SynchronizedClock;

impl Clock for SynchronizedClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn precision(&self) -> Precision {
        Precision::Synchronized
    }
}

/// A wall-clock reading captured once at construction, advanced by a
/// monotonic high-resolution counter. Readings never go backwards but can
/// drift from the NTP-adjusted wall clock over long uptimes.
#[derive(Debug)]
pub struct FastClock {
    base: DateTime<Utc>,
    started: Instant,
}

impl FastClock {
    pub fn new() -> Self {
        Self {
            base: Utc::now(),
            started: Instant::now(),
        }
    }
}

impl Default for FastClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FastClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = Duration::from_std(self.started.elapsed()).unwrap_or(Duration::MAX);
        self.base
            .checked_add_signed(elapsed)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn precision(&self) -> Precision {
        Precision::Fast
    }
}

/// A clock for tests: a pure function from the previous reading to the
/// next one, plus the retained previous reading. Every query applies the
/// function once and stores the result, so a test controls exactly how
/// time advances between observations.
pub struct TestClock {
    state: Mutex<TestState>,
}

struct TestState {
    last: DateTime<Utc>,
    step: Box<dyn Fn(DateTime<Utc>) -> DateTime<Utc> + Send>,
}

impl TestClock {
    /// A clock advanced by `step` on every construction-supplied `f(last)`.
    pub fn new<F>(start: DateTime<Utc>, f: F) -> Self
    where
        F: Fn(DateTime<Utc>) -> DateTime<Utc> + Send + 'static,
    {
        Self {
            state: Mutex::new(TestState {
                last: start,
                step: Box::new(f),
            }),
        }
    }

    /// Always reads `at` until [`TestClock::set`] moves it.
    pub fn fixed(at: DateTime<Utc>) -> Self {
        Self::new(at, |last| last)
    }

    /// First reading is `start`; every subsequent reading advances by `step`.
    pub fn stepping(start: DateTime<Utc>, step: Duration) -> Self {
        let first = start.checked_sub_signed(step).unwrap_or(start);
        Self::new(first, move |last| {
            last.checked_add_signed(step)
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
        })
    }

    /// Always reads the maximum representable instant.
    pub fn never() -> Self {
        Self::fixed(DateTime::<Utc>::MAX_UTC)
    }

    /// Moves the retained reading, e.g. to jump a fixed clock forward.
    pub fn set(&self, at: DateTime<Utc>) {
        self.state.lock().unwrap().last = at;
    }

    /// The retained reading, without advancing the clock.
    pub fn last(&self) -> DateTime<Utc> {
        self.state.lock().unwrap().last
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        let mut state = self.state.lock().unwrap();
        let next = (state.step)(state.last);
        state.last = next;
        next
    }

    fn precision(&self) -> Precision {
        Precision::Standard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn instant(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn fixed_clock_repeats_the_same_reading() {
        let clock = TestClock::fixed(instant(1_000));
        assert_eq!(clock.now(), instant(1_000));
        assert_eq!(clock.now(), instant(1_000));
    }

    #[test]
    fn fixed_clock_can_be_jumped() {
        let clock = TestClock::fixed(instant(1_000));
        clock.now();
        clock.set(instant(4_000));
        assert_eq!(clock.now(), instant(4_000));
    }

    #[test]
    fn stepping_clock_starts_at_start_and_advances_per_query() {
        let clock = TestClock::stepping(instant(50), Duration::seconds(10));
        assert_eq!(clock.now(), instant(50));
        assert_eq!(clock.now(), instant(60));
        assert_eq!(clock.now(), instant(70));
    }

    #[test]
    fn custom_step_functions_drive_the_clock() {
        // Doubles the distance from the epoch on every reading.
        let clock = TestClock::new(instant(100), |last| last + (last - instant(0)));
        assert_eq!(clock.now(), instant(200));
        assert_eq!(clock.now(), instant(400));
        assert_eq!(clock.last(), instant(400));
    }

    #[test]
    fn never_clock_reads_the_maximum_instant() {
        let clock = TestClock::never();
        assert_eq!(clock.now(), DateTime::<Utc>::MAX_UTC);
        assert_eq!(clock.now(), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn fast_clock_never_goes_backwards() {
        let clock = FastClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
        assert_eq!(clock.precision(), Precision::Fast);
    }

    #[test]
    fn production_clocks_report_their_precision() {
        assert_eq!(StandardClock.precision(), Precision::Standard);
        assert_eq!(SynchronizedClock.precision(), Precision::Synchronized);
    }
}
