//! Per-subscription auto-update timers.
//!
//! Every subscription with auto-update enabled owns exactly one pending
//! timer, keyed `reload-schedule:<id>`.  When it fires, a small task on the
//! scheduler queue
//!
//! 1. checks the timer is still the current one for that subscription,
//! 2. detects a late firing (the machine slept) and, if so, waits an extra
//!    [`SchedulerTuning::wake_delay`] so the network can come back first,
//! 3. queues a reload with default priority, and
//! 4. re-arms itself for the next interval.
//!
//! Preference changes replace the binding atomically under one lock, so
//! an in-flight firing of an old timer can never re-arm after it was
//! superseded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::context::ShutdownFlag;
use crate::events::{EventHub, ListenerId, SubscriptionEvent};
use crate::model::{Subscription, SubscriptionId, SubscriptionPrefs};
use crate::ports::SubscriptionStore;
use crate::reload::Reloader;
use crate::task::{Monitor, Priority, Task, TaskQueue, TaskStatus};
use crate::timer::Timers;

/// Concurrent firings handled by the scheduler's own queue.  Each only
/// hands a reload to the reload queue, so a few slots suffice.
const SCHEDULER_SLOTS: usize = 4;

/// Source of wall-clock time.  The monotonic clock stops while the machine
/// is suspended, so lateness has to be measured on the calendar clock.
pub type WallClock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Late-firing detection knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerTuning {
    /// A timer firing later than its interval plus this is treated as a
    /// wake from hibernation.
    pub hibernate_grace: Duration,
    /// Extra wait before reloading after such a wake.
    pub wake_delay: Duration,
}

impl Default for SchedulerTuning {
    fn default() -> Self {
        Self {
            hibernate_grace: Duration::from_secs(5 * 60),
            wake_delay: Duration::from_secs(30),
        }
    }
}

/// `Some(delay)` if a timer set for `interval` that fired after `elapsed`
/// must wait before reloading.
pub fn wake_delay(tuning: &SchedulerTuning, interval: Duration, elapsed: Duration) -> Option<Duration> {
    (elapsed > interval + tuning.hibernate_grace).then_some(tuning.wake_delay)
}

/// Wall-clock time between `since` and `now`; zero if the clock went back.
fn elapsed_between(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

/// The live timer binding of one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub interval: Duration,
    /// When the timer was installed or last fired, on the wall clock.
    pub last_run: DateTime<Utc>,
    generation: u64,
}

/// Result of applying preferences to a subscription's binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingChange {
    Installed,
    /// The interval changed; `cancelled` old timers were dropped.
    Rescheduled { cancelled: usize },
    Unchanged,
    Removed { cancelled: usize },
    /// Auto-update is off and nothing was bound.
    Idle,
}

struct SchedulerInner {
    bindings: Mutex<HashMap<SubscriptionId, Binding>>,
    timers: Timers,
    queue: TaskQueue,
    reloader: Reloader,
    subscriptions: Arc<dyn SubscriptionStore>,
    shutdown: ShutdownFlag,
    tuning: SchedulerTuning,
    clock: WallClock,
    next_generation: AtomicU64,
}

#[derive(Clone)]
pub struct ReloadScheduler {
    inner: Arc<SchedulerInner>,
}

fn timer_key(id: SubscriptionId) -> String {
    format!("reload-schedule:{}", id.0)
}

fn interval_of(prefs: &SubscriptionPrefs) -> Duration {
    Duration::from_secs(prefs.interval_secs.max(1))
}

impl ReloadScheduler {
    pub fn new(
        timers: Timers,
        reloader: Reloader,
        subscriptions: Arc<dyn SubscriptionStore>,
        shutdown: ShutdownFlag,
        tuning: SchedulerTuning,
    ) -> Self {
        Self::with_clock(timers, reloader, subscriptions, shutdown, tuning, Arc::new(Utc::now))
    }

    /// Like [`new`](Self::new), reading wall-clock time from `clock`.
    pub fn with_clock(
        timers: Timers,
        reloader: Reloader,
        subscriptions: Arc<dyn SubscriptionStore>,
        shutdown: ShutdownFlag,
        tuning: SchedulerTuning,
        clock: WallClock,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                bindings: Mutex::new(HashMap::new()),
                timers,
                queue: TaskQueue::new("Scheduled Reloads", SCHEDULER_SLOTS),
                reloader,
                subscriptions,
                shutdown,
                tuning,
                clock,
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Follow subscription preference changes and deletions on `events`.
    pub fn attach(&self, events: &EventHub) -> ListenerId {
        let weak: Weak<SchedulerInner> = Arc::downgrade(&self.inner);
        events.subscriptions.subscribe(move |event| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match event {
                SubscriptionEvent::PrefsChanged { id, prefs } => {
                    inner.apply(*id, prefs);
                }
                SubscriptionEvent::Deleted(id) => {
                    inner.remove(*id);
                }
                SubscriptionEvent::ErrorChanged { .. } => {}
            }
        })
    }

    /// Bind a timer for `subscription` if it auto-updates.
    pub fn install(&self, subscription: &Subscription) -> BindingChange {
        self.inner.apply(subscription.id, &subscription.prefs)
    }

    /// Diff `prefs` against the current binding and fix it up.
    pub fn on_prefs_changed(&self, id: SubscriptionId, prefs: &SubscriptionPrefs) -> BindingChange {
        self.inner.apply(id, prefs)
    }

    /// Drop the binding of a deleted subscription.  Returns the number of
    /// timers cancelled.
    pub fn remove(&self, id: SubscriptionId) -> usize {
        self.inner.remove(id)
    }

    pub fn binding(&self, id: SubscriptionId) -> Option<Binding> {
        self.inner.lock().get(&id).cloned()
    }

    pub fn bound(&self) -> Vec<SubscriptionId> {
        let mut ids: Vec<_> = self.inner.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Timers pending for `id`; at most one while running normally.
    pub fn pending_timers(&self, id: SubscriptionId) -> usize {
        self.inner.timers.pending(&timer_key(id))
    }

    /// Cancel every binding and any scheduled firing in flight.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        let ids: Vec<SubscriptionId> = inner.lock().drain().map(|(id, _)| id).collect();
        for id in &ids {
            inner.timers.cancel(&timer_key(*id));
        }
        inner.queue.cancel(false);
        debug!(bindings = ids.len(), "scheduler stopped");
    }
}

impl SchedulerInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriptionId, Binding>> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(self: &Arc<Self>, id: SubscriptionId, prefs: &SubscriptionPrefs) -> BindingChange {
        let mut bindings = self.lock();
        if !prefs.auto_update || self.shutdown.is_set() {
            return match bindings.remove(&id) {
                Some(_) => BindingChange::Removed {
                    cancelled: self.timers.cancel(&timer_key(id)),
                },
                None => BindingChange::Idle,
            };
        }

        let interval = interval_of(prefs);
        let existing = bindings.get(&id).map(|b| b.interval);
        if existing == Some(interval) {
            return BindingChange::Unchanged;
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        bindings.insert(
            id,
            Binding {
                interval,
                last_run: (self.clock)(),
                generation,
            },
        );
        let cancelled = self.arm(id, generation, interval, false);
        debug!(subscription = %id, ?interval, "auto-update bound");
        match existing {
            Some(_) => BindingChange::Rescheduled { cancelled },
            None => BindingChange::Installed,
        }
    }

    fn remove(&self, id: SubscriptionId) -> usize {
        let mut bindings = self.lock();
        bindings.remove(&id);
        self.timers.cancel(&timer_key(id))
    }

    /// Replace the timer of `id`.  Callers hold the bindings lock.
    fn arm(self: &Arc<Self>, id: SubscriptionId, generation: u64, delay: Duration, after_wake: bool) -> usize {
        let weak = Arc::downgrade(self);
        self.timers.reschedule(&timer_key(id), delay, move || {
            if let Some(inner) = weak.upgrade() {
                inner.fire(id, generation, after_wake);
            }
        })
    }

    fn fire(self: &Arc<Self>, id: SubscriptionId, generation: u64, after_wake: bool) {
        if self.shutdown.is_set() {
            return;
        }
        self.queue.submit([Arc::new(ScheduledReload {
            key: format!("scheduled:{}:{generation}:{after_wake}", id.0),
            id,
            generation,
            after_wake,
            scheduler: Arc::clone(self),
        }) as Arc<dyn Task>]);
    }

    fn run_scheduled(self: &Arc<Self>, id: SubscriptionId, generation: u64, after_wake: bool) -> TaskStatus {
        if self.shutdown.is_set() {
            return TaskStatus::Cancelled;
        }
        {
            let mut bindings = self.lock();
            let Some(binding) = bindings.get_mut(&id) else {
                return TaskStatus::Ok;
            };
            if binding.generation != generation {
                debug!(subscription = %id, "superseded timer fired");
                return TaskStatus::Ok;
            }
            if !after_wake {
                let now = (self.clock)();
                let elapsed = elapsed_between(binding.last_run, now);
                binding.last_run = now;
                if let Some(delay) = wake_delay(&self.tuning, binding.interval, elapsed) {
                    info!(subscription = %id, late = ?elapsed, "woke from sleep, delaying reload");
                    self.arm(id, generation, delay, true);
                    return TaskStatus::Ok;
                }
            }
        }

        let auto_update = self
            .subscriptions
            .get(id)
            .map(|sub| sub.prefs.auto_update)
            .unwrap_or(false);
        if !auto_update {
            let mut bindings = self.lock();
            if bindings.get(&id).is_some_and(|b| b.generation == generation) {
                bindings.remove(&id);
                self.timers.cancel(&timer_key(id));
            }
            return TaskStatus::Ok;
        }

        self.reloader.reload_with_priority(&[id], Priority::Default);

        let bindings = self.lock();
        if let Some(binding) = bindings.get(&id).filter(|b| b.generation == generation) {
            self.arm(id, generation, binding.interval, false);
        }
        TaskStatus::Ok
    }
}

struct ScheduledReload {
    key: String,
    id: SubscriptionId,
    generation: u64,
    after_wake: bool,
    scheduler: Arc<SchedulerInner>,
}

impl Task for ScheduledReload {
    fn key(&self) -> &str {
        &self.key
    }

    fn name(&self) -> String {
        format!("Scheduled reload {}", self.id)
    }

    fn run(&self, monitor: &Monitor) -> TaskStatus {
        if monitor.is_cancelled() {
            return TaskStatus::Cancelled;
        }
        self.scheduler.run_scheduled(self.id, self.generation, self.after_wake)
    }
}
