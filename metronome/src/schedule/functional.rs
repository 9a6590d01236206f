use super::{Schedule, ScheduleOptions};
use crate::scheduler::Scheduler;
use chrono::DateTime;
use chrono_tz::Tz;

type NextFn = dyn Fn(DateTime<Tz>) -> Option<DateTime<Tz>> + Send + Sync;

/// Delegates the next-fire-time computation to an arbitrary function of
/// the previous fire time.
pub struct Functional {
    name: String,
    options: ScheduleOptions,
    f: Box<NextFn>,
}

impl Functional {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(DateTime<Tz>) -> Option<DateTime<Tz>> + Send + Sync + 'static,
    {
        Self::with_options(f, ScheduleOptions::empty())
    }

    pub fn with_options<F>(f: F, options: ScheduleOptions) -> Self
    where
        F: Fn(DateTime<Tz>) -> Option<DateTime<Tz>> + Send + Sync + 'static,
    {
        Self {
            name: "functional".to_owned(),
            options,
            f: Box::new(f),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl Schedule for Functional {
    fn name(&self) -> &str {
        &self.name
    }

    fn options(&self) -> ScheduleOptions {
        self.options
    }

    fn next(&self, _scheduler: &Scheduler, last: DateTime<Tz>) -> Option<DateTime<Tz>> {
        (self.f)(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Scheduler;
    use chrono::{Duration, TimeZone, Utc};

    fn zoned(secs: i64) -> DateTime<Tz> {
        Utc.timestamp_opt(secs, 0).unwrap().with_timezone(&Tz::UTC)
    }

    #[tokio::test]
    async fn applies_the_function_to_last() {
        let scheduler = Scheduler::new();
        let schedule = Functional::new(|last| last.checked_add_signed(Duration::seconds(7)));
        assert_eq!(schedule.next(&scheduler, zoned(10)), Some(zoned(17)));
    }

    #[tokio::test]
    async fn none_exhausts_the_schedule() {
        let scheduler = Scheduler::new();
        let schedule = Functional::new(|_| None);
        assert_eq!(schedule.next(&scheduler, zoned(10)), None);
    }
}
