use crate::schedule::{apply_options, Schedule, ScheduleOptions};
use crate::scheduler::{Scheduler, SchedulerCore};
use crate::{JobFn, JobId};
use chrono::DateTime;
use chrono_tz::Tz;
use futures::channel::oneshot;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::error::Error;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio_util::sync::CancellationToken;

/// An executable unit. The scheduler never inspects a job; it only calls
/// `run` and observes the returned future's resolution.
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    fn run(&self, state: JobState, cancel: CancellationToken) -> BoxFuture<'static, crate::Result>;
}

pub(crate) struct FnJob {
    name: String,
    f: Box<dyn JobFn>,
}

impl FnJob {
    pub(crate) fn new(name: impl Into<String>, f: impl JobFn + 'static) -> Self {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }
}

impl Job for FnJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, state: JobState, cancel: CancellationToken) -> BoxFuture<'static, crate::Result> {
        self.f.call(state, cancel)
    }
}

/// How an execution resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    /// The job resolved to an error while its token was still live.
    Failed,
    /// The token was triggered, or the caller's view of a coalesced
    /// execution was cancelled.
    Cancelled,
    /// An automatic fire of a disabled or detached record.
    Skipped,
}

/// A caller's view of one execution.
pub type Execution = BoxFuture<'static, Outcome>;

/// The debounced completion shared by every caller that coalesced onto the
/// same underlying execution.
pub(crate) type Completion = Shared<BoxFuture<'static, Outcome>>;

fn ready_completion(outcome: Outcome) -> Completion {
    futures::future::ready(outcome).boxed().shared()
}

struct ExecutionSlot {
    sequence: u64,
    completion: Completion,
}

/// One registration: a job, its schedule, and the execution state the
/// engine tracks for it.
///
/// The stored due time is `None` exactly when the record is disabled,
/// detached from its engine, or its schedule is exhausted. At most one
/// execution is in flight at a time; concurrent fire requests, manual or
/// automatic, coalesce onto it.
pub struct JobRecord {
    id: JobId,
    job: Arc<dyn Job>,
    schedule: Arc<dyn Schedule>,
    scheduler: Weak<SchedulerCore>,
    enabled: AtomicBool,
    manual: AtomicBool,
    sequence: AtomicU64,
    execution: Mutex<Option<ExecutionSlot>>,
    due: Mutex<Option<DateTime<Tz>>>,
}

impl JobRecord {
    pub(crate) fn new(
        id: JobId,
        job: Arc<dyn Job>,
        schedule: Arc<dyn Schedule>,
        scheduler: Weak<SchedulerCore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            job,
            schedule,
            scheduler,
            enabled: AtomicBool::new(true),
            manual: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            execution: Mutex::new(None),
            due: Mutex::new(None),
        })
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.job.name()
    }

    pub fn schedule(&self) -> &Arc<dyn Schedule> {
        &self.schedule
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Enables or disables the record. An effective change recomputes the
    /// due time from the engine's current clock reading and wakes the
    /// engine; disabling clears the due time but leaves an in-flight
    /// execution to finish under its own token.
    pub fn set_enabled(&self, enabled: bool) {
        let previous = self.enabled.swap(enabled, Ordering::AcqRel);
        if previous == enabled {
            return;
        }
        self.update_due(true);
        if let Some(core) = self.scheduler.upgrade() {
            core.kick();
        }
    }

    /// True while an execution of this record is in flight.
    pub fn is_executing(&self) -> bool {
        self.execution.lock().unwrap().is_some()
    }

    /// True while the in-flight execution was started by [`JobRecord::execute`].
    pub fn is_manual(&self) -> bool {
        self.manual.load(Ordering::Acquire)
    }

    /// The next fire time, observable only while both the record and its
    /// engine are enabled and the record is still registered.
    pub fn due(&self) -> Option<DateTime<Tz>> {
        let Some(core) = self.scheduler.upgrade() else {
            return None;
        };
        if core.is_disposed()
            || !core.is_enabled()
            || !self.is_enabled()
            || !core.is_attached(self.id)
        {
            return None;
        }
        *self.due.lock().unwrap()
    }

    /// Fires the job now, out of band.
    ///
    /// If an execution is already in flight the call coalesces onto it:
    /// the returned future resolves with that execution's outcome, except
    /// that cancelling `cancel` resolves this caller's view as
    /// [`Outcome::Cancelled`] without disturbing the underlying run. An
    /// already-cancelled token resolves immediately.
    pub fn execute(self: &Arc<Self>, cancel: CancellationToken) -> Execution {
        if cancel.is_cancelled() {
            return Box::pin(futures::future::ready(Outcome::Cancelled));
        }
        let (completion, coalesced) = self.start_execution(cancel.clone(), true);
        if coalesced {
            Box::pin(async move {
                tokio::select! {
                    outcome = completion => outcome,
                    _ = cancel.cancelled_owned() => Outcome::Cancelled,
                }
            })
        } else {
            Box::pin(completion)
        }
    }

    pub(crate) fn execute_scheduled(self: &Arc<Self>, cancel: CancellationToken) -> Completion {
        self.start_execution(cancel, false).0
    }

    /// The debounce core. Publishes a new execution only if the slot is
    /// empty; otherwise every caller receives the in-flight completion.
    fn start_execution(
        self: &Arc<Self>,
        cancel: CancellationToken,
        manual: bool,
    ) -> (Completion, bool) {
        if !manual && !self.is_enabled() {
            return (ready_completion(Outcome::Skipped), false);
        }
        let Some(core) = self.scheduler.upgrade().filter(|core| !core.is_disposed()) else {
            return (ready_completion(Outcome::Cancelled), false);
        };

        let mut slot = self.execution.lock().unwrap();
        if let Some(existing) = slot.as_ref() {
            return (existing.completion.clone(), true);
        }
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        if manual {
            self.manual.store(true, Ordering::Release);
            *self.due.lock().unwrap() = Some(core.zoned_now());
        }
        let due = *self.due.lock().unwrap();

        let (sender, receiver) = oneshot::channel();
        let completion: Completion = async move { receiver.await.unwrap_or(Outcome::Cancelled) }
            .boxed()
            .shared();
        *slot = Some(ExecutionSlot {
            sequence,
            completion: completion.clone(),
        });
        drop(slot);

        let state = JobState {
            record: Arc::clone(self),
            manual,
            due,
        };
        let job = Arc::clone(&self.job);
        let token = cancel.clone();
        let work = core
            .runtime()
            .spawn(async move { job.run(state, token).await });

        let record = Arc::clone(self);
        core.runtime().spawn(async move {
            let outcome = match work.await {
                Ok(Ok(())) => Outcome::Succeeded,
                Ok(Err(error)) => {
                    if cancel.is_cancelled() {
                        Outcome::Cancelled
                    } else {
                        record.log_failure(error.as_ref());
                        Outcome::Failed
                    }
                }
                Err(join_error) if join_error.is_cancelled() => Outcome::Cancelled,
                Err(join_error) => {
                    log::error!(
                        target: "metronome::job",
                        "job {} panicked: {join_error}",
                        record.name()
                    );
                    Outcome::Failed
                }
            };
            if outcome == Outcome::Failed
                && !record.schedule.options().contains(ScheduleOptions::IGNORE_ERRORS)
            {
                record.set_enabled(false);
            }
            record.manual.store(false, Ordering::Release);
            record.clear_execution(sequence);
            record.update_due(false);
            // An unchanged due suppresses the notification inside
            // update_due, but the record just stopped executing, so the
            // engine must still re-evaluate it while a due exists.
            if record.due.lock().unwrap().is_some() {
                if let Some(core) = record.scheduler.upgrade() {
                    core.kick();
                }
            }
            let _ = sender.send(outcome);
        });

        (completion, false)
    }

    fn clear_execution(&self, sequence: u64) {
        let mut slot = self.execution.lock().unwrap();
        if slot.as_ref().map(|active| active.sequence) == Some(sequence) {
            *slot = None;
        }
    }

    /// Recomputes the stored due time under the record's due mutex and
    /// wakes the engine if it changed. `force` recomputes from the current
    /// clock reading even for schedules that normally chain from the
    /// previous due time.
    pub(crate) fn update_due(&self, force: bool) {
        let mut due = self.due.lock().unwrap();
        let previous = *due;
        let next = self.compute_due(previous, force);
        *due = next;
        drop(due);
        if previous != next {
            if let Some(core) = self.scheduler.upgrade() {
                core.kick();
            }
        }
    }

    fn compute_due(&self, current: Option<DateTime<Tz>>, force: bool) -> Option<DateTime<Tz>> {
        let Some(core) = self.scheduler.upgrade() else {
            return None;
        };
        if core.is_disposed() || !self.is_enabled() || !core.is_attached(self.id) {
            return None;
        }
        let options = self.schedule.options();
        let now = core.zoned_now();
        let last = if options.contains(ScheduleOptions::FROM_DUE) && !force {
            current.unwrap_or(now)
        } else {
            now
        };
        let scheduler = Scheduler::from_core(core);
        let next = self.schedule.next(&scheduler, last);
        apply_options(next, options)
    }

    pub(crate) fn detach(&self) {
        *self.due.lock().unwrap() = None;
    }

    fn log_failure(&self, error: &(dyn Error + Send + Sync + 'static)) {
        if let Some(core) = self.scheduler.upgrade() {
            log::warn!(
                target: "metronome::job",
                "job {} failed at {}: {error}",
                self.name(),
                core.zoned_now()
            );
        } else {
            log::warn!(target: "metronome::job", "job {} failed: {error}", self.name());
        }
        let mut source = error.source();
        while let Some(cause) = source {
            log::warn!(
                target: "metronome::job",
                "job {} failure cause: {cause}",
                self.name()
            );
            source = cause.source();
        }
    }
}

/// What a running job can observe and adjust about its own registration.
pub struct JobState {
    record: Arc<JobRecord>,
    manual: bool,
    due: Option<DateTime<Tz>>,
}

impl JobState {
    pub fn id(&self) -> JobId {
        self.record.id()
    }

    pub fn name(&self) -> &str {
        self.record.name()
    }

    pub fn scheduler(&self) -> Option<Scheduler> {
        self.record.scheduler.upgrade().map(Scheduler::from_core)
    }

    /// The schedule that produced this fire, absent on manual fires.
    pub fn schedule(&self) -> Option<Arc<dyn Schedule>> {
        if self.manual {
            None
        } else {
            Some(Arc::clone(&self.record.schedule))
        }
    }

    /// The due time this fire was started for.
    pub fn due(&self) -> Option<DateTime<Tz>> {
        self.due
    }

    pub fn is_manual(&self) -> bool {
        self.manual
    }

    pub fn is_executing(&self) -> bool {
        self.record.is_executing()
    }

    pub fn is_enabled(&self) -> bool {
        self.record.is_enabled()
    }

    /// Writing `false` prevents any further scheduled fires of this job.
    pub fn set_enabled(&self, enabled: bool) {
        self.record.set_enabled(enabled);
    }
}
