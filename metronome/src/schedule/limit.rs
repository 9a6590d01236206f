use super::{Schedule, ScheduleOptions};
use crate::scheduler::Scheduler;
use chrono::DateTime;
use chrono_tz::Tz;
use std::sync::{Arc, Mutex};

/// Caps an inner schedule at a number of distinct fire times.
///
/// The most recent (input, output) pair is cached: the engine may query
/// `next` repeatedly with an unchanged `last`, and those queries must be
/// answered from the cache without consuming a fire. A fire is consumed
/// only when the inner schedule yields a fire time different from the
/// cached one; an exhausted inner schedule (`None`) consumes nothing.
pub struct Limit {
    name: String,
    inner: Arc<dyn Schedule>,
    state: Mutex<LimitState>,
}

struct LimitState {
    remaining: usize,
    cache: Option<(DateTime<Tz>, Option<DateTime<Tz>>)>,
}

impl Limit {
    pub fn new(count: usize, inner: Arc<dyn Schedule>) -> Self {
        Self {
            name: "limit".to_owned(),
            inner,
            state: Mutex::new(LimitState {
                remaining: count,
                cache: None,
            }),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Distinct fire times still available.
    pub fn remaining(&self) -> usize {
        self.state.lock().unwrap().remaining
    }
}

impl Schedule for Limit {
    fn name(&self) -> &str {
        &self.name
    }

    fn options(&self) -> ScheduleOptions {
        self.inner.options()
    }

    fn next(&self, scheduler: &Scheduler, last: DateTime<Tz>) -> Option<DateTime<Tz>> {
        let mut state = self.state.lock().unwrap();
        if state.remaining == 0 {
            return None;
        }
        if let Some((cached_in, cached_out)) = state.cache {
            if cached_in == last {
                return cached_out;
            }
        }
        let output = self.inner.next(scheduler, last);
        if let Some(next) = output {
            let cached_out = state.cache.and_then(|(_, out)| out);
            if cached_out != Some(next) {
                state.remaining -= 1;
            }
        }
        state.cache = Some((last, output));
        output
    }
}
