//! Schedulable units of work and the primitives that run them.
//!
//! ## Overview
//!
//! ```text
//!  submit()  ┌────────────┐  pop   ┌──────────┐  register  ┌──────────────┐
//! ─────────► │ TaskQueue  │ ─────► │  worker  │ ─────────► │ TaskRegistry │
//!            │ (pending)  │        │ (thread) │            │ (per family) │
//!            └────────────┘        └──────────┘            └──────────────┘
//!                  │ counters
//!                  ▼
//!            ┌────────────┐
//!            │  progress  │ ──► ProgressSink (UI)
//!            └────────────┘
//! ```
//!
//! * [`Task`] — identity, display name, priority and a `run` body.
//! * [`Monitor`] — the cancellation handle every long-running body checks.
//! * [`TaskQueue`] — bounded-concurrency executor.
//! * [`BatchedBuffer`] — debounce primitive built on a one-slot queue.

mod batch;
mod progress;
mod queue;
mod registry;

pub use batch::BatchedBuffer;
pub use progress::{ProgressBudget, ProgressSink};
pub use queue::{TaskQueue, TaskQueueBuilder};
pub use registry::{HandleId, TaskRegistry};

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::ReloadError;

/// Scheduling bias of a task.  Never preempts a running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    /// Jumps ahead of already pending work (interactive single refresh).
    Short,
    #[default]
    Default,
    Long,
}

/// How a task body finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Ok,
    Cancelled,
    Error(ReloadError),
}

/// One unit of schedulable work.
///
/// `key` is the identity used to detect duplicates in a queue's pending
/// list: two tasks with equal keys are the same work.
pub trait Task: Send + Sync {
    fn key(&self) -> &str;

    fn name(&self) -> String;

    fn priority(&self) -> Priority {
        Priority::Default
    }

    fn run(&self, monitor: &Monitor) -> TaskStatus;
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MonitorState {
    cancelled: bool,
    subtask: Option<String>,
}

#[derive(Default)]
struct MonitorInner {
    state: Mutex<MonitorState>,
    wake: Condvar,
}

/// Cancellation/progress handle passed to every task body.
///
/// Cloning yields another handle to the same flag.
#[derive(Clone, Default)]
pub struct Monitor {
    inner: Arc<MonitorInner>,
}

impl Monitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Request cancellation and wake any [`sleep`](Self::sleep)er.
    pub fn cancel(&self) {
        self.lock().cancelled = true;
        self.inner.wake.notify_all();
    }

    /// Sleep for `duration` unless cancelled first.
    ///
    /// Returns `true` if the full duration elapsed, `false` on cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut state = self.lock();
        loop {
            if state.cancelled {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            state = self
                .inner
                .wake
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Name of the step currently being worked on, for progress display.
    pub fn set_subtask(&self, name: impl Into<String>) {
        self.lock().subtask = Some(name.into());
    }

    pub fn subtask(&self) -> Option<String> {
        self.lock().subtask.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// A task built from a closure; handy for one-off work and tests.
pub struct FnTask<F> {
    key: String,
    name: String,
    priority: Priority,
    body: F,
}

impl<F> FnTask<F>
where
    F: Fn(&Monitor) -> TaskStatus + Send + Sync,
{
    pub fn new(key: impl Into<String>, body: F) -> Self {
        let key = key.into();
        Self {
            name: key.clone(),
            key,
            priority: Priority::Default,
            body,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

impl<F> Task for FnTask<F>
where
    F: Fn(&Monitor) -> TaskStatus + Send + Sync,
{
    fn key(&self) -> &str {
        &self.key
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn run(&self, monitor: &Monitor) -> TaskStatus {
        (self.body)(monitor)
    }
}
