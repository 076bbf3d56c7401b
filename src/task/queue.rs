//! Bounded-concurrency task queue.
//!
//! Workers are plain threads.  A worker pops one task at a time and, when it
//! finishes, immediately polls the pending list again before giving up its
//! slot, so a busy queue never pays for spinning up a fresh worker.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::progress::progress_label;
use crate::error::ReloadError;
use super::{Monitor, Priority, ProgressBudget, ProgressSink, Task, TaskRegistry, TaskStatus};

/// Re-check interval while [`TaskQueue::cancel`] joins running workers.
const JOIN_POLL: Duration = Duration::from_millis(50);

/// How often the progress reporter samples the work counters.
const PROGRESS_POLL: Duration = Duration::from_millis(100);

static NEXT_FAMILY: AtomicU64 = AtomicU64::new(1);

struct ProgressConfig {
    sink: Arc<dyn ProgressSink>,
    delay: Duration,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Arc<dyn Task>>,
    workers: usize,
    total: usize,
    done: usize,
    current: Option<String>,
    progress: Option<Monitor>,
}

struct QueueInner {
    name: String,
    family: String,
    max_concurrent: usize,
    registry: Arc<TaskRegistry>,
    progress: Option<ProgressConfig>,
    state: Mutex<QueueState>,
    drained: Condvar,
    failures: AtomicU64,
}

/// Builder for [`TaskQueue`].
pub struct TaskQueueBuilder {
    name: String,
    max_concurrent: usize,
    registry: Option<Arc<TaskRegistry>>,
    progress: Option<ProgressConfig>,
}

impl TaskQueueBuilder {
    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    /// Share a registry so other components can cancel this queue's family.
    pub fn registry(mut self, registry: Arc<TaskRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Aggregate progress into `sink`, shown only once a batch has been
    /// running for `delay`.
    pub fn progress(mut self, sink: Arc<dyn ProgressSink>, delay: Duration) -> Self {
        self.progress = Some(ProgressConfig { sink, delay });
        self
    }

    pub fn build(self) -> TaskQueue {
        let family = format!(
            "{}#{}",
            self.name,
            NEXT_FAMILY.fetch_add(1, Ordering::Relaxed)
        );
        TaskQueue {
            inner: Arc::new(QueueInner {
                name: self.name,
                family,
                max_concurrent: self.max_concurrent,
                registry: self.registry.unwrap_or_default(),
                progress: self.progress,
                state: Mutex::new(QueueState::default()),
                drained: Condvar::new(),
                failures: AtomicU64::new(0),
            }),
        }
    }
}

/// Runs submitted tasks on at most `max_concurrent` worker threads.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    pub fn builder(name: impl Into<String>) -> TaskQueueBuilder {
        TaskQueueBuilder {
            name: name.into(),
            max_concurrent: 1,
            registry: None,
            progress: None,
        }
    }

    pub fn new(name: impl Into<String>, max_concurrent: usize) -> Self {
        Self::builder(name).max_concurrent(max_concurrent).build()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Family key under which this queue's running tasks are registered.
    pub fn family(&self) -> &str {
        &self.inner.family
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    /// Queue every task whose key is not already pending.
    ///
    /// Returns the number of tasks actually appended.
    pub fn submit<I>(&self, tasks: I) -> usize
    where
        I: IntoIterator<Item = Arc<dyn Task>>,
    {
        let inner = &self.inner;
        let mut state = inner.lock();

        let mut appended = 0;
        for task in tasks {
            if state.pending.iter().any(|p| p.key() == task.key()) {
                debug!(queue = %inner.name, task = task.key(), "already queued");
                continue;
            }
            if task.priority() == Priority::Short {
                let at = state
                    .pending
                    .iter()
                    .take_while(|p| p.priority() == Priority::Short)
                    .count();
                state.pending.insert(at, task);
            } else {
                state.pending.push_back(task);
            }
            appended += 1;
        }
        if appended == 0 {
            return 0;
        }
        state.total += appended;

        let free = inner.max_concurrent.saturating_sub(state.workers);
        let spawn = free.min(state.pending.len());
        state.workers += spawn;

        let progress = if inner.progress.is_some() && state.progress.is_none() {
            let monitor = Monitor::new();
            state.progress = Some(monitor.clone());
            Some(monitor)
        } else {
            None
        };
        drop(state);

        for _ in 0..spawn {
            inner.spawn_worker();
        }
        if let Some(monitor) = progress {
            inner.spawn_progress(monitor);
        }
        appended
    }

    /// `true` iff a task with `key` is waiting; running tasks are not queued.
    pub fn is_queued(&self, key: &str) -> bool {
        self.inner.lock().pending.iter().any(|p| p.key() == key)
    }

    /// `true` iff every submitted task has completed.
    pub fn is_empty(&self) -> bool {
        let state = self.inner.lock();
        state.done == state.total
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn active_workers(&self) -> usize {
        self.inner.lock().workers
    }

    /// Tasks that ended in [`TaskStatus::Error`] or panicked, since creation.
    pub fn failures(&self) -> u64 {
        self.inner.failures.load(Ordering::Relaxed)
    }

    /// Drop all pending tasks and cancel the running ones.
    ///
    /// With `join_running` the caller blocks until every worker of this
    /// queue has exited.  Never call it with `join_running` from inside one
    /// of this queue's own tasks.
    pub fn cancel(&self, join_running: bool) {
        self.inner.cancel(join_running);
    }
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel(&self, join_running: bool) {
        let mut state = self.lock();
        let dropped = state.pending.len();
        state.pending.clear();
        state.total = state.total.saturating_sub(dropped);
        let running = self.registry.cancel_family(&self.family);
        if let Some(progress) = state.progress.take() {
            progress.cancel();
        }
        info!(queue = %self.name, dropped, running, "queue cancelled");

        if join_running {
            while state.workers > 0 {
                state = self
                    .drained
                    .wait_timeout(state, JOIN_POLL)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            debug!(queue = %self.name, "queue joined");
        }
    }

    fn spawn_worker(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("{}-worker", self.name))
            .spawn(move || inner.work());
        if let Err(e) = spawned {
            error!(queue = %self.name, error = %e, "failed to spawn worker");
            let mut state = self.lock();
            state.workers -= 1;
            if state.workers == 0 {
                self.drained.notify_all();
            }
        }
    }

    fn work(&self) {
        let mut finished = false;
        loop {
            let (task, handle, monitor) = {
                let mut state = self.lock();
                if finished {
                    state.done += 1;
                }
                let Some(task) = state.pending.pop_front() else {
                    state.workers -= 1;
                    if state.workers == 0 {
                        self.drained.notify_all();
                    }
                    return;
                };
                state.current = Some(task.name());
                // Registered under the queue lock so cancel() cannot miss it.
                let (handle, monitor) = self.registry.register(&self.family);
                (task, handle, monitor)
            };

            self.execute(task.as_ref(), &monitor);
            self.registry.unregister(&self.family, handle);
            finished = true;
        }
    }

    fn execute(&self, task: &dyn Task, monitor: &Monitor) {
        let started = Instant::now();
        let status = panic::catch_unwind(AssertUnwindSafe(|| task.run(monitor)))
            .unwrap_or_else(|payload| TaskStatus::Error(panic_failure(payload.as_ref())));
        match status {
            TaskStatus::Ok => {
                debug!(queue = %self.name, task = task.key(), elapsed = ?started.elapsed(), "task done");
            }
            TaskStatus::Cancelled => {
                debug!(queue = %self.name, task = task.key(), "task cancelled");
            }
            TaskStatus::Error(failure @ ReloadError::InternalTaskFailure(_)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                error!(queue = %self.name, task = task.key(), error = %failure, "task panicked");
            }
            TaskStatus::Error(failure) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(queue = %self.name, task = task.key(), error = %failure, "task failed");
            }
        }
    }

    fn spawn_progress(self: &Arc<Self>, monitor: Monitor) {
        let inner = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("{}-progress", self.name))
            .spawn(move || inner.report_progress(monitor));
        if let Err(e) = spawned {
            warn!(queue = %self.name, error = %e, "failed to spawn progress reporter");
            self.lock().progress = None;
        }
    }

    fn report_progress(&self, monitor: Monitor) {
        let Some(config) = &self.progress else {
            return;
        };
        let started = Instant::now();
        let mut budget = ProgressBudget::new(100);
        let mut seen_done = 0;
        let mut visible = false;

        loop {
            if visible && config.sink.is_cancelled() {
                info!(queue = %self.name, "progress dismissed, cancelling queue");
                self.cancel(false);
            }

            let (done, total, current) = {
                let mut state = self.lock();
                if monitor.is_cancelled() {
                    break;
                }
                if state.done >= state.total {
                    state.done = 0;
                    state.total = 0;
                    state.current = None;
                    state.progress = None;
                    break;
                }
                (state.done, state.total, state.current.clone())
            };

            if !visible && started.elapsed() >= config.delay {
                visible = true;
            }
            if visible {
                for finished in seen_done..done {
                    budget.complete_one(total - finished);
                }
                seen_done = done;
                let label = progress_label(&self.name, done, total, current.as_deref());
                config.sink.update(&label, budget.shown());
            }
            monitor.sleep(PROGRESS_POLL);
        }
        config.sink.done();
    }
}

/// Turn a caught panic payload into an internal task failure.
fn panic_failure(payload: &(dyn Any + Send)) -> ReloadError {
    let cause = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic".to_string());
    ReloadError::InternalTaskFailure(cause)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::FnTask;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    fn task<F>(key: &str, body: F) -> Arc<dyn Task>
    where
        F: Fn(&Monitor) -> TaskStatus + Send + Sync + 'static,
    {
        Arc::new(FnTask::new(key, body))
    }

    fn wait_until<F: Fn() -> bool>(cond: F) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn concurrency_never_exceeds_the_cap() {
        let queue = TaskQueue::new("cap", 3);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for batch in 0..4 {
            let tasks: Vec<Arc<dyn Task>> = (0..5)
                .map(|i| {
                    let running = Arc::clone(&running);
                    let peak = Arc::clone(&peak);
                    task(&format!("t{batch}-{i}"), move |_| {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(10));
                        running.fetch_sub(1, Ordering::SeqCst);
                        TaskStatus::Ok
                    })
                })
                .collect();
            queue.submit(tasks);
        }

        wait_until(|| queue.is_empty());
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 2, "work should overlap");
        wait_until(|| queue.active_workers() == 0);
    }

    #[test]
    fn duplicate_keys_are_not_queued_twice() {
        let queue = TaskQueue::new("dup", 1);
        let gate = Arc::new(AtomicBool::new(false));
        let runs = Arc::new(AtomicUsize::new(0));

        let g = Arc::clone(&gate);
        queue.submit([task("blocker", move |_| {
            while !g.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(2));
            }
            TaskStatus::Ok
        })]);
        wait_until(|| !queue.is_queued("blocker"));

        let r1 = Arc::clone(&runs);
        let r2 = Arc::clone(&runs);
        assert_eq!(
            queue.submit([
                task("same", move |_| {
                    r1.fetch_add(1, Ordering::SeqCst);
                    TaskStatus::Ok
                }),
                task("same", move |_| {
                    r2.fetch_add(1, Ordering::SeqCst);
                    TaskStatus::Ok
                }),
            ]),
            1
        );
        assert!(queue.is_queued("same"));

        gate.store(true, Ordering::SeqCst);
        wait_until(|| queue.is_empty());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn started_task_is_no_longer_queued() {
        let queue = TaskQueue::new("started", 1);
        let started = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));

        let (s, r) = (Arc::clone(&started), Arc::clone(&release));
        queue.submit([task("slow", move |_| {
            s.store(true, Ordering::SeqCst);
            while !r.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(2));
            }
            TaskStatus::Ok
        })]);

        wait_until(|| started.load(Ordering::SeqCst));
        assert!(!queue.is_queued("slow"));
        assert!(!queue.is_empty());

        release.store(true, Ordering::SeqCst);
        wait_until(|| queue.is_empty());
    }

    #[test]
    fn failing_and_panicking_tasks_do_not_stop_the_worker() {
        let queue = TaskQueue::new("faulty", 1);
        let after = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&after);

        queue.submit([
            task("err", |_| TaskStatus::Error(ReloadError::Connection("boom".into()))),
            task("panic", |_| panic!("worker must survive this")),
            task("ok", move |_| {
                a.fetch_add(1, Ordering::SeqCst);
                TaskStatus::Ok
            }),
        ]);

        wait_until(|| queue.is_empty());
        assert_eq!(after.load(Ordering::SeqCst), 1);
        assert_eq!(queue.failures(), 2);
    }

    #[test]
    fn panic_payload_becomes_internal_failure() {
        let caught = panic::catch_unwind(|| panic!("index offline")).unwrap_err();
        assert_eq!(
            panic_failure(caught.as_ref()),
            ReloadError::InternalTaskFailure("index offline".into())
        );

        let code = 7;
        let caught = panic::catch_unwind(|| panic!("exit code {code}")).unwrap_err();
        assert_eq!(
            panic_failure(caught.as_ref()),
            ReloadError::InternalTaskFailure("exit code 7".into())
        );
    }

    #[test]
    fn short_priority_jumps_ahead_of_pending_work() {
        let queue = TaskQueue::new("prio", 1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(AtomicBool::new(false));

        let g = Arc::clone(&gate);
        queue.submit([task("gate", move |_| {
            while !g.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(2));
            }
            TaskStatus::Ok
        })]);
        wait_until(|| !queue.is_queued("gate"));

        let record = |name: &'static str| {
            let order = Arc::clone(&order);
            move |_: &Monitor| {
                order.lock().unwrap().push(name);
                TaskStatus::Ok
            }
        };
        queue.submit([task("a", record("a")), task("b", record("b"))]);
        let urgent: Arc<dyn Task> =
            Arc::new(FnTask::new("urgent", record("urgent")).with_priority(Priority::Short));
        queue.submit([urgent]);

        gate.store(true, Ordering::SeqCst);
        wait_until(|| queue.is_empty());
        assert_eq!(*order.lock().unwrap(), vec!["urgent", "a", "b"]);
    }

    #[test]
    fn cancel_with_join_waits_for_running_and_drops_pending() {
        let queue = TaskQueue::new("save", 1);
        let finished = Arc::new(AtomicBool::new(false));
        let pending_ran = Arc::new(AtomicBool::new(false));
        let started = Arc::new(AtomicBool::new(false));

        let (f, s) = (Arc::clone(&finished), Arc::clone(&started));
        let p = Arc::clone(&pending_ran);
        queue.submit([
            task("in-flight", move |_| {
                s.store(true, Ordering::SeqCst);
                // ignores cancellation, like a save that must complete
                thread::sleep(Duration::from_millis(80));
                f.store(true, Ordering::SeqCst);
                TaskStatus::Ok
            }),
            task("never", move |_| {
                p.store(true, Ordering::SeqCst);
                TaskStatus::Ok
            }),
        ]);
        wait_until(|| started.load(Ordering::SeqCst));

        queue.cancel(true);

        assert!(finished.load(Ordering::SeqCst), "join returned before in-flight work");
        assert_eq!(queue.active_workers(), 0);
        thread::sleep(Duration::from_millis(30));
        assert!(!pending_ran.load(Ordering::SeqCst));
        assert!(queue.is_empty());
    }

    #[test]
    fn cancel_signals_running_monitors() {
        let queue = TaskQueue::new("cancel", 2);
        let observed = Arc::new(AtomicBool::new(false));
        let o = Arc::clone(&observed);
        queue.submit([task("sleeper", move |m| {
            if !m.sleep(Duration::from_secs(30)) {
                o.store(true, Ordering::SeqCst);
                return TaskStatus::Cancelled;
            }
            TaskStatus::Ok
        })]);
        wait_until(|| queue.active_workers() == 1 && !queue.is_queued("sleeper"));
        thread::sleep(Duration::from_millis(10));

        queue.cancel(true);
        assert!(observed.load(Ordering::SeqCst));
    }

    #[derive(Default)]
    struct RecordingSink {
        updates: Mutex<Vec<(String, u32)>>,
        done: AtomicUsize,
        dismissed: AtomicBool,
    }

    impl ProgressSink for RecordingSink {
        fn update(&self, label: &str, percent: u32) {
            self.updates.lock().unwrap().push((label.to_string(), percent));
        }

        fn done(&self) {
            self.done.fetch_add(1, Ordering::SeqCst);
        }

        fn is_cancelled(&self) -> bool {
            self.dismissed.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn progress_reports_label_and_finishes_once() {
        let sink = Arc::new(RecordingSink::default());
        let queue = TaskQueue::builder("Updating Feeds")
            .max_concurrent(2)
            .progress(sink.clone(), Duration::ZERO)
            .build();

        let tasks: Vec<Arc<dyn Task>> = (0..4)
            .map(|i| {
                Arc::new(
                    FnTask::new(format!("feed-{i}"), |_| {
                        thread::sleep(Duration::from_millis(60));
                        TaskStatus::Ok
                    })
                    .with_name(format!("Feed {i}")),
                ) as Arc<dyn Task>
            })
            .collect();
        queue.submit(tasks);

        wait_until(|| sink.done.load(Ordering::SeqCst) == 1);
        let updates = sink.updates.lock().unwrap().clone();
        assert!(!updates.is_empty());
        assert!(updates[0].0.starts_with("Updating Feeds ("));
        assert!(updates[0].0.contains(" of 4)"));
        assert!(updates.windows(2).all(|w| w[0].1 <= w[1].1));

        // counters were reset for the next batch
        assert!(queue.is_empty());
        thread::sleep(Duration::from_millis(150));
        assert_eq!(sink.done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dismissing_progress_cancels_the_family() {
        let sink = Arc::new(RecordingSink::default());
        let queue = TaskQueue::builder("dismiss")
            .max_concurrent(2)
            .progress(sink.clone(), Duration::ZERO)
            .build();
        let cancelled = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<Arc<dyn Task>> = (0..5)
            .map(|i| {
                let c = Arc::clone(&cancelled);
                task(&format!("long-{i}"), move |m| {
                    if !m.sleep(Duration::from_secs(30)) {
                        c.fetch_add(1, Ordering::SeqCst);
                        return TaskStatus::Cancelled;
                    }
                    TaskStatus::Ok
                })
            })
            .collect();
        queue.submit(tasks);
        wait_until(|| !sink.updates.lock().unwrap().is_empty());

        sink.dismissed.store(true, Ordering::SeqCst);

        wait_until(|| cancelled.load(Ordering::SeqCst) == 2);
        wait_until(|| queue.active_workers() == 0);
        assert_eq!(queue.pending_len(), 0);
    }
}
