use super::{Schedule, ScheduleError, ScheduleOptions};
use crate::scheduler::Scheduler;
use chrono::DateTime;
use chrono_tz::Tz;
use std::sync::Arc;

/// Combines child schedules by firing at the earliest of their next fire
/// times. A child answering at or before `last` forces an immediate
/// re-fire at `last` itself.
///
/// Children must agree on their option bitsets, since the record applies a
/// single set of options to whichever child produced the winning time.
pub struct Aggregate {
    name: String,
    options: ScheduleOptions,
    children: Vec<Arc<dyn Schedule>>,
}

impl Aggregate {
    pub fn new(children: Vec<Arc<dyn Schedule>>) -> Result<Self, ScheduleError> {
        let options = children
            .first()
            .map(|child| child.options())
            .unwrap_or_default();
        if children.iter().any(|child| child.options() != options) {
            return Err(ScheduleError::AggregateOptions);
        }
        Ok(Self {
            name: "aggregate".to_owned(),
            options,
            children,
        })
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl Schedule for Aggregate {
    fn name(&self) -> &str {
        &self.name
    }

    fn options(&self) -> ScheduleOptions {
        self.options
    }

    fn next(&self, scheduler: &Scheduler, last: DateTime<Tz>) -> Option<DateTime<Tz>> {
        let mut earliest: Option<DateTime<Tz>> = None;
        for child in &self.children {
            let Some(next) = child.next(scheduler, last) else {
                continue;
            };
            if next <= last {
                return Some(last);
            }
            if earliest.map_or(true, |current| next < current) {
                earliest = Some(next);
            }
        }
        earliest
    }
}
