use super::{Schedule, ScheduleOptions};
use crate::scheduler::Scheduler;
use chrono::{DateTime, Duration};
use chrono_tz::Tz;

/// Fires a fixed interval after the previous fire. The interval is clamped
/// to zero at construction, so a negative gap behaves like "immediately
/// again".
pub struct Gap {
    name: String,
    options: ScheduleOptions,
    gap: Duration,
}

impl Gap {
    pub fn new(gap: Duration) -> Self {
        Self::with_options(gap, ScheduleOptions::empty())
    }

    pub fn with_options(gap: Duration, options: ScheduleOptions) -> Self {
        Self {
            name: "gap".to_owned(),
            options,
            gap: gap.max(Duration::zero()),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl Schedule for Gap {
    fn name(&self) -> &str {
        &self.name
    }

    fn options(&self) -> ScheduleOptions {
        self.options
    }

    fn next(&self, _scheduler: &Scheduler, last: DateTime<Tz>) -> Option<DateTime<Tz>> {
        // Pure addition on the instant axis; the zone is inherited from `last`.
        last.checked_add_signed(self.gap)
    }
}
