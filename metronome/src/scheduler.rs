use crate::clock::{Clock, StandardClock};
use crate::job::{FnJob, Job, JobRecord};
use crate::schedule::{Schedule, ScheduleOptions};
use crate::{JobFn, JobId};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use fxhash::FxHasher32;
use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration as StdDuration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Tick-state value marking a disposed engine; non-negative values count
/// pending wake-ups (0 idle, 1 active, >1 re-evaluate before sleeping).
const DISPOSED: i64 = i64::MIN;

/// Waits at or below this are satisfied by a cooperative spin against the
/// engine clock, since OS timers cannot resolve them.
const MIN_TIMER_WAIT_MS: i64 = 1;

/// The longest single timer programming; longer waits are clamped and the
/// loop re-evaluates when the timer fires.
const MAX_TIMER_WAIT: StdDuration = StdDuration::from_millis(u32::MAX as u64);

/// Looks timezones up by IANA name.
pub trait ZoneProvider: Send + Sync {
    fn zone(&self, name: &str) -> Option<Tz>;
}

/// The IANA database bundled with `chrono-tz`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TzDb;

impl ZoneProvider for TzDb {
    fn zone(&self, name: &str) -> Option<Tz> {
        name.parse().ok()
    }
}

/// The scheduling engine: owns the registered job records, decides what is
/// due, and arms a single timer for the nearest future due time.
///
/// `Scheduler` is a cheap handle; clones share the same engine. The engine
/// spawns its evaluation loop and job executions on the ambient tokio
/// runtime, so a `Scheduler` must be constructed from within one.
///
/// Dropping handles does not stop the engine while executions are in
/// flight; call [`Scheduler::dispose`] to cancel the master token and
/// retire it deterministically.
#[derive(Clone)]
pub struct Scheduler {
    core: Arc<SchedulerCore>,
}

impl Scheduler {
    /// An engine on the OS wall clock, anchored to UTC.
    pub fn new() -> Self {
        Self::with_zone(Tz::UTC)
    }

    /// An engine on the OS wall clock; `zone` anchors the due times handed
    /// to schedules.
    pub fn with_zone(zone: Tz) -> Self {
        Self::with_clock(Arc::new(StandardClock), zone)
    }

    /// An engine on a caller-supplied clock, e.g. a virtual clock in tests.
    pub fn with_clock(clock: Arc<dyn Clock>, zone: Tz) -> Self {
        Self {
            core: Arc::new(SchedulerCore {
                jobs: RwLock::new(HashMap::with_hasher(BuildHasherDefault::default())),
                enabled: AtomicBool::new(true),
                tick_state: AtomicI64::new(0),
                timer: Mutex::new(None),
                clock,
                zones: Arc::new(TzDb),
                zone,
                max_duration: Mutex::new(None),
                master: Mutex::new(Some(CancellationToken::new())),
                next_due: Mutex::new(None),
                next_id: AtomicU32::new(0),
                runtime: Handle::current(),
            }),
        }
    }

    pub(crate) fn from_core(core: Arc<SchedulerCore>) -> Self {
        Self { core }
    }

    /// Registers a job. The record starts enabled and its first due time
    /// is computed from the engine's current clock reading.
    pub fn add(&self, job: Arc<dyn Job>, schedule: Arc<dyn Schedule>) -> Arc<JobRecord> {
        let id = self.core.next_id.fetch_add(1, Ordering::Relaxed);
        let record = JobRecord::new(id, job, schedule, Arc::downgrade(&self.core));
        self.core
            .jobs
            .write()
            .unwrap()
            .insert(id, Arc::clone(&record));
        log::debug!(
            target: "metronome::scheduler",
            "registered job {} (id={id})",
            record.name()
        );
        record.update_due(true);
        self.core.kick();
        record
    }

    /// Registers an async closure under a name.
    pub fn add_fn(
        &self,
        name: impl Into<String>,
        f: impl JobFn + 'static,
        schedule: Arc<dyn Schedule>,
    ) -> Arc<JobRecord> {
        self.add(Arc::new(FnJob::new(name, f)), schedule)
    }

    /// Detaches a record from the engine. An in-flight execution of the
    /// record keeps running under the token it was given.
    pub fn try_remove(&self, record: &JobRecord) -> bool {
        let removed = {
            let mut jobs = self.core.jobs.write().unwrap();
            match jobs.get(&record.id()) {
                Some(existing) if std::ptr::eq(existing.as_ref(), record) => {
                    jobs.remove(&record.id());
                    true
                }
                _ => false,
            }
        };
        if removed {
            record.detach();
            log::debug!(
                target: "metronome::scheduler",
                "removed job {} (id={})",
                record.name(),
                record.id()
            );
            self.core.kick();
        }
        removed
    }

    pub fn is_enabled(&self) -> bool {
        self.core.is_enabled()
    }

    /// Disabling suppresses new fires without cancelling in-flight
    /// executions; re-enabling recomputes every record's due time from the
    /// current clock reading and re-evaluates.
    pub fn set_enabled(&self, enabled: bool) {
        let previous = self.core.enabled.swap(enabled, Ordering::AcqRel);
        if previous == enabled {
            return;
        }
        if enabled {
            let records: Vec<Arc<JobRecord>> =
                self.core.jobs.read().unwrap().values().cloned().collect();
            for record in records {
                record.update_due(true);
            }
        }
        self.core.kick();
    }

    /// Retires the engine: the timer is released, the master token is
    /// cancelled once (signalling every active execution), and later adds
    /// fire nothing. Safe to call repeatedly.
    pub fn dispose(&self) {
        let previous = self.core.tick_state.swap(DISPOSED, Ordering::AcqRel);
        if previous < 0 {
            return;
        }
        self.core.disarm_timer();
        let master = self.core.master.lock().unwrap().take();
        if let Some(master) = master {
            master.cancel();
        }
        log::info!(target: "metronome::scheduler", "scheduler disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.core.is_disposed()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.core.clock
    }

    pub fn zone_provider(&self) -> &Arc<dyn ZoneProvider> {
        &self.core.zones
    }

    /// The zone due times are anchored to for newly computed dues.
    pub fn zone(&self) -> Tz {
        self.core.zone
    }

    /// The engine-wide bound on a single execution, `None` for unbounded.
    /// Schedules flagged [`ScheduleOptions::LONG_RUNNING`] are exempt.
    pub fn maximum_execution_duration(&self) -> Option<StdDuration> {
        *self.core.max_duration.lock().unwrap()
    }

    pub fn set_maximum_execution_duration(&self, max: Option<StdDuration>) {
        *self.core.max_duration.lock().unwrap() = max;
    }

    /// The nearest future due time observed by the last evaluation sweep.
    pub fn next_due(&self) -> Option<DateTime<Tz>> {
        self.core
            .next_due
            .lock()
            .unwrap()
            .map(|instant| instant.with_timezone(&self.core.zone))
    }

    /// The engine clock's reading, anchored to the engine zone.
    pub fn zoned_now(&self) -> DateTime<Tz> {
        self.core.zoned_now()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct SchedulerCore {
    jobs: RwLock<HashMap<JobId, Arc<JobRecord>, BuildHasherDefault<FxHasher32>>>,
    enabled: AtomicBool,
    tick_state: AtomicI64,
    timer: Mutex<Option<JoinHandle<()>>>,
    clock: Arc<dyn Clock>,
    zones: Arc<dyn ZoneProvider>,
    zone: Tz,
    max_duration: Mutex<Option<StdDuration>>,
    master: Mutex<Option<CancellationToken>>,
    next_due: Mutex<Option<DateTime<Utc>>>,
    next_id: AtomicU32,
    runtime: Handle,
}

impl SchedulerCore {
    pub(crate) fn is_disposed(&self) -> bool {
        self.tick_state.load(Ordering::Acquire) < 0
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn is_attached(&self, id: JobId) -> bool {
        self.jobs.read().unwrap().contains_key(&id)
    }

    pub(crate) fn zoned_now(&self) -> DateTime<Tz> {
        self.clock.now().with_timezone(&self.zone)
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Wake-up entry point for every event source: timer expiry, job-set
    /// mutations, and execution completions. Bumps the tick-state; only
    /// the 0 -> 1 transition owns a new evaluation loop, any other bump is
    /// observed by the iteration already running.
    pub(crate) fn kick(self: &Arc<Self>) {
        let previous = match self.tick_state.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |state| if state < 0 { None } else { Some(state + 1) },
        ) {
            Ok(previous) => previous,
            Err(_) => return,
        };
        if previous > 0 {
            return;
        }
        self.disarm_timer();
        let core = Arc::clone(self);
        self.runtime.spawn(async move {
            SchedulerCore::run(core).await;
        });
    }

    fn disarm_timer(&self) {
        if let Some(timer) = self.timer.lock().unwrap().take() {
            timer.abort();
        }
    }

    fn arm_timer(self: &Arc<Self>, wait: StdDuration) {
        let weak = Arc::downgrade(self);
        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(wait).await;
            if let Some(core) = weak.upgrade() {
                core.kick();
            }
        });
        let mut timer = self.timer.lock().unwrap();
        if let Some(previous) = timer.replace(handle) {
            previous.abort();
        }
    }

    /// The evaluation loop. Runs on at most one task at a time; the
    /// tick-state protocol makes re-entrant wake-ups (including the ones
    /// caused by the executions it fires) collapse into an extra sweep
    /// instead of a second loop.
    async fn run(core: Arc<Self>) {
        loop {
            // Collapse pending bumps into this iteration; negative means
            // disposed.
            if core
                .tick_state
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                    if state < 0 {
                        None
                    } else {
                        Some(1)
                    }
                })
                .is_err()
            {
                return;
            }
            if !core.is_enabled() {
                let _ = core.tick_state.fetch_update(
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    |state| if state < 0 { None } else { Some(0) },
                );
                return;
            }

            let now = core.clock.now();
            let records: Vec<Arc<JobRecord>> =
                core.jobs.read().unwrap().values().cloned().collect();
            let mut due_now: Vec<(DateTime<Utc>, Arc<JobRecord>)> = Vec::new();
            let mut next: Option<DateTime<Utc>> = None;
            for record in records {
                if record.is_executing() {
                    continue;
                }
                let Some(due) = record.due() else { continue };
                let due = due.with_timezone(&Utc);
                if due <= now {
                    due_now.push((due, record));
                } else if next.map_or(true, |soonest| due < soonest) {
                    next = Some(due);
                }
            }
            due_now.sort_by(|(a, left), (b, right)| {
                a.cmp(b).then_with(|| left.id().cmp(&right.id()))
            });
            for (_, record) in &due_now {
                core.fire(record);
            }

            if core.tick_state.load(Ordering::Acquire) > 1 {
                tokio::task::yield_now().await;
                continue;
            }

            *core.next_due.lock().unwrap() = next;

            let Some(next_instant) = next else {
                // Nothing scheduled; park without a timer.
                match core
                    .tick_state
                    .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => return,
                    Err(state) if state < 0 => return,
                    Err(_) => continue,
                }
            };

            let wait = next_instant - core.clock.now();
            if wait <= chrono::Duration::milliseconds(MIN_TIMER_WAIT_MS) {
                // Below the OS timer floor; spin against the engine clock.
                while core.clock.now() < next_instant {
                    if core.tick_state.load(Ordering::Acquire) < 0 {
                        return;
                    }
                    tokio::task::yield_now().await;
                }
                continue;
            }

            let wait = wait.to_std().unwrap_or_default().min(MAX_TIMER_WAIT);
            log::trace!(
                target: "metronome::scheduler",
                "sleeping {wait:?} until the next due time"
            );
            core.arm_timer(wait);
            match core
                .tick_state
                .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(state) if state < 0 => {
                    core.disarm_timer();
                    return;
                }
                Err(_) => {
                    // A wake-up raced the arm; take the timer back and
                    // re-evaluate.
                    core.disarm_timer();
                    continue;
                }
            }
        }
    }

    /// Starts a due record's execution, choosing its cancellation token:
    /// the master token alone for long-running or unbounded engines,
    /// otherwise a child of the master that a watchdog cancels once the
    /// maximum execution duration elapses.
    fn fire(self: &Arc<Self>, record: &Arc<JobRecord>) {
        let Some(master) = self.master.lock().unwrap().clone() else {
            return;
        };
        let options = record.schedule().options();
        let max = *self.max_duration.lock().unwrap();
        log::info!(
            target: "metronome::scheduler",
            "firing job {} (id={}) at {}",
            record.name(),
            record.id(),
            self.zoned_now()
        );
        match max {
            Some(max) if !options.contains(ScheduleOptions::LONG_RUNNING) => {
                let deadline = master.child_token();
                let completion = record.execute_scheduled(deadline.clone());
                // The watchdog ends with the execution, so the linkage
                // never outlives the run it bounds.
                self.runtime.spawn(async move {
                    tokio::select! {
                        _ = completion => {}
                        _ = tokio::time::sleep(max) => {
                            deadline.cancel();
                        }
                    }
                });
            }
            _ => {
                let _ = record.execute_scheduled(master);
            }
        }
    }
}
