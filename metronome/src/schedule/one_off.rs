use super::{Schedule, ScheduleOptions};
use crate::scheduler::Scheduler;
use chrono::DateTime;
use chrono_tz::Tz;

/// Fires once, at a fixed zoned timestamp.
pub struct OneOff {
    name: String,
    options: ScheduleOptions,
    at: DateTime<Tz>,
}

impl OneOff {
    pub fn new(at: DateTime<Tz>) -> Self {
        Self::with_options(at, ScheduleOptions::empty())
    }

    pub fn with_options(at: DateTime<Tz>, options: ScheduleOptions) -> Self {
        Self {
            name: "one-off".to_owned(),
            options,
            at,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl Schedule for OneOff {
    fn name(&self) -> &str {
        &self.name
    }

    fn options(&self) -> ScheduleOptions {
        self.options
    }

    fn next(&self, _scheduler: &Scheduler, last: DateTime<Tz>) -> Option<DateTime<Tz>> {
        // Instant-axis comparison; the zones of `at` and `last` may differ.
        if self.at > last {
            Some(self.at)
        } else {
            None
        }
    }
}
