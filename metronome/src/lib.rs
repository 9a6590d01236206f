//! An in-process job scheduler driven by composable schedules.
//!
//! A [`Scheduler`] owns a set of registered jobs. Each job is paired with a
//! [`Schedule`], a pure "next fire time" function, and the scheduler arms a
//! single timer for the nearest due time across all enabled jobs. Schedules
//! are timezone-aware (`chrono-tz`), so cron-style jobs behave correctly
//! across DST transitions, and the engine clock is swappable so everything
//! can be driven by virtual time in tests.
//!
//! # Example
//!
//! ```no_run
//! use metronome::{Gap, Limit, Scheduler};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let scheduler = Scheduler::with_zone(chrono_tz::America::Chicago);
//!
//!     scheduler.add_fn(
//!         "greeter",
//!         |_state, _cancel| async {
//!             println!("Hello World!");
//!             Ok(())
//!         },
//!         Arc::new(Limit::new(5, Arc::new(Gap::new(chrono::Duration::minutes(1))))),
//!     );
//!
//!     // "Hello World!" prints five times over the next five minutes.
//!     tokio::time::sleep(std::time::Duration::from_secs(360)).await;
//!     scheduler.dispose();
//! }
//! ```
//!
//! A job is anything implementing [`Job`]; for the common case an async
//! closure taking the per-run [`JobState`] and a [`CancellationToken`] can
//! be registered directly through [`Scheduler::add_fn`]. Jobs run as spawned
//! tasks on the ambient tokio runtime, so a slow job never delays the
//! scheduler itself, and concurrent fire requests for the same job coalesce
//! into a single execution.
//!
//! Failures are reported through the returned [`Outcome`]: a job that
//! resolves to an error is logged (every cause in the chain) and its record
//! is disabled unless the schedule carries
//! [`ScheduleOptions::IGNORE_ERRORS`]. Cancellation is not a failure and
//! never disables a job.

pub use self::clock::{Clock, FastClock, Precision, StandardClock, SynchronizedClock, TestClock};
pub use self::job::{Execution, Job, JobRecord, JobState, Outcome};
pub use self::schedule::{
    apply_options, Aggregate, Cron, Functional, Gap, Limit, OneOff, Schedule, ScheduleError,
    ScheduleOptions,
};
pub use self::scheduler::{Scheduler, TzDb, ZoneProvider};

use futures::{future::BoxFuture, Future};
use tokio_util::sync::CancellationToken;

mod clock;
mod job;
mod schedule;
mod scheduler;

/// What a job run resolves to. An `Err` counts as a failure unless the
/// job's cancellation token had already been triggered.
pub type Result =
    core::result::Result<(), Box<dyn std::error::Error + core::marker::Send + core::marker::Sync>>;

/// Identifier a [`Scheduler`] assigns to each registered job record.
pub type JobId = u32;

/// Adapted from Ibraheem Ahmed's solution on https://stackoverflow.com, Feb 5, 2021.
/// An implementation to store async functions as trait objects in structs.
pub trait JobFn: core::marker::Send + core::marker::Sync {
    fn call(&self, state: JobState, cancel: CancellationToken) -> BoxFuture<'static, Result>;
}

impl<T, F> JobFn for T
where
    T: Fn(JobState, CancellationToken) -> F + core::marker::Send + core::marker::Sync + 'static,
    F: Future<Output = Result> + core::marker::Send + 'static,
{
    fn call(&self, state: JobState, cancel: CancellationToken) -> BoxFuture<'static, Result> {
        Box::pin(self(state, cancel))
    }
}
