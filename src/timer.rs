//! One-shot timers tagged by key.
//!
//! A single background thread keeps timers ordered by due time and runs each
//! callback when it fires.  Callbacks run on that thread, so they must only
//! hand work off (typically by submitting to a [`TaskQueue`](crate::task::TaskQueue)).
//!
//! Timers are cancelled by key rather than by handle: everything scheduled
//! for one subscription, or one buffer, shares a key.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error};

type Callback = Box<dyn FnOnce() + Send>;

struct Entry {
    key: String,
    callback: Callback,
}

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    entries: HashMap<u64, Entry>,
    next_id: u64,
    shutdown: bool,
}

struct TimerInner {
    state: Mutex<TimerState>,
    wake: Condvar,
}

/// Shared handle to the timer thread.
#[derive(Clone)]
pub struct Timers {
    inner: Arc<TimerInner>,
}

impl Timers {
    /// Start the timer thread.
    pub fn new(name: &str) -> std::io::Result<Self> {
        let inner = Arc::new(TimerInner {
            state: Mutex::new(TimerState::default()),
            wake: Condvar::new(),
        });
        let worker = Arc::clone(&inner);
        thread::Builder::new()
            .name(format!("{name}-timers"))
            .spawn(move || worker.run())?;
        Ok(Self { inner })
    }

    /// Run `callback` once, `delay` from now.
    pub fn schedule<F>(&self, key: &str, delay: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.lock();
        Self::insert(&mut state, key, delay, Box::new(callback));
        drop(state);
        self.inner.wake.notify_one();
    }

    /// Cancel every timer of `key` and schedule `callback` in its place,
    /// atomically.  Returns how many timers were cancelled.
    pub fn reschedule<F>(&self, key: &str, delay: Duration, callback: F) -> usize
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.lock();
        let cancelled = Self::remove_key(&mut state, key);
        Self::insert(&mut state, key, delay, Box::new(callback));
        drop(state);
        self.inner.wake.notify_one();
        cancelled
    }

    /// Cancel every outstanding timer of `key`.
    pub fn cancel(&self, key: &str) -> usize {
        let mut state = self.inner.lock();
        Self::remove_key(&mut state, key)
    }

    /// Number of outstanding timers for `key`.
    pub fn pending(&self, key: &str) -> usize {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|e| e.key == key)
            .count()
    }

    /// Total number of outstanding timers.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every outstanding timer and stop the thread.
    pub fn shutdown(&self) {
        let mut state = self.inner.lock();
        state.shutdown = true;
        state.entries.clear();
        state.heap.clear();
        drop(state);
        self.inner.wake.notify_all();
    }

    fn insert(state: &mut TimerState, key: &str, delay: Duration, callback: Callback) {
        if state.shutdown {
            debug!(key, "timer ignored after shutdown");
            return;
        }
        let id = state.next_id;
        state.next_id += 1;
        state.heap.push(Reverse((Instant::now() + delay, id)));
        state.entries.insert(
            id,
            Entry {
                key: key.to_string(),
                callback,
            },
        );
    }

    fn remove_key(state: &mut TimerState, key: &str) -> usize {
        let before = state.entries.len();
        state.entries.retain(|_, e| e.key != key);
        before - state.entries.len()
    }
}

impl TimerInner {
    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run(&self) {
        let mut state = self.lock();
        loop {
            if state.shutdown {
                return;
            }
            let Some(&Reverse((due, id))) = state.heap.peek() else {
                state = self.wake.wait(state).unwrap_or_else(PoisonError::into_inner);
                continue;
            };
            if !state.entries.contains_key(&id) {
                // cancelled
                state.heap.pop();
                continue;
            }
            let now = Instant::now();
            if due > now {
                state = self
                    .wake
                    .wait_timeout(state, due - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
                continue;
            }

            state.heap.pop();
            let Some(entry) = state.entries.remove(&id) else {
                continue;
            };
            drop(state);
            if panic::catch_unwind(AssertUnwindSafe(entry.callback)).is_err() {
                error!(key = %entry.key, "timer callback panicked");
            }
            state = self.lock();
        }
    }
}
