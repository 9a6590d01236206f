use crate::scheduler::Scheduler;
use bitflags::bitflags;
use chrono::DateTime;
use chrono_tz::Tz;
use core::fmt;

mod aggregate;
mod align;
mod cron_schedule;
mod functional;
mod gap;
mod limit;
mod one_off;

pub use self::aggregate::Aggregate;
pub use self::align::apply_options;
pub use self::cron_schedule::Cron;
pub use self::functional::Functional;
pub use self::gap::Gap;
pub use self::limit::Limit;
pub use self::one_off::OneOff;

bitflags! {
    /// Per-schedule behaviour flags. The flags are independent; alignment
    /// flags are resolved coarsest-first when several are set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ScheduleOptions: u8 {
        /// A failed run does not disable the job record.
        const IGNORE_ERRORS = 1;
        /// `next` is asked relative to the previous due time rather than
        /// the previous completion time.
        const FROM_DUE = 1 << 1;
        /// Round the computed due time up to the next whole second.
        const ALIGN_SECONDS = 1 << 2;
        /// Round the computed due time up to the next whole minute.
        const ALIGN_MINUTES = 1 << 3;
        /// Round the computed due time up to the next whole hour.
        const ALIGN_HOURS = 1 << 4;
        /// Round the computed due time up to the next whole day.
        ///
        /// Alignment is applied after the schedule's own arithmetic, so a
        /// grain coarser than a cron schedule's grid can coalesce adjacent
        /// cron occurrences into a single fire.
        const ALIGN_DAYS = 1 << 5;
        /// Exempt executions from the scheduler-wide maximum duration.
        const LONG_RUNNING = 1 << 6;
    }
}

impl ScheduleOptions {
    /// The active alignment boundary in nanoseconds, coarsest flag first.
    pub(crate) fn alignment_nanos(self) -> Option<i128> {
        const NANOS_PER_SECOND: i128 = 1_000_000_000;
        if self.contains(Self::ALIGN_DAYS) {
            Some(86_400 * NANOS_PER_SECOND)
        } else if self.contains(Self::ALIGN_HOURS) {
            Some(3_600 * NANOS_PER_SECOND)
        } else if self.contains(Self::ALIGN_MINUTES) {
            Some(60 * NANOS_PER_SECOND)
        } else if self.contains(Self::ALIGN_SECONDS) {
            Some(NANOS_PER_SECOND)
        } else {
            None
        }
    }
}

/// A source of fire times.
///
/// `next` is a pure function of `last`: querying repeatedly with the same
/// argument must yield the same answer, because the engine may re-ask at
/// any point. `last` is the previous completion time (or previous due time
/// under [`ScheduleOptions::FROM_DUE`]); on the first query, or after a
/// record is re-enabled, it is the engine's current zoned time.
///
/// Returning `None` means the schedule is exhausted; the record's due time
/// clears and it will not fire again unless re-enabled.
pub trait Schedule: Send + Sync {
    fn name(&self) -> &str;

    fn options(&self) -> ScheduleOptions;

    fn next(&self, scheduler: &Scheduler, last: DateTime<Tz>) -> Option<DateTime<Tz>>;
}

#[derive(Debug)]
pub enum ScheduleError {
    /// The cron expression did not parse.
    Cron(cron::error::Error),
    /// Aggregated child schedules carry differing option bitsets.
    AggregateOptions,
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleError::Cron(err) => write!(f, "invalid cron expression: {err}"),
            ScheduleError::AggregateOptions => {
                write!(f, "aggregated schedules must share the same options")
            }
        }
    }
}

impl std::error::Error for ScheduleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ScheduleError::Cron(err) => Some(err),
            ScheduleError::AggregateOptions => None,
        }
    }
}
