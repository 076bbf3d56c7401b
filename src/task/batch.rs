//! Debounce buffer that coalesces bursts of additions into one delivery.
//!
//! The first addition to an empty buffer arms a single timer.  Later
//! additions only join the held batch; they never move the timer.  When the
//! timer fires the batch is swapped out and handed to the receiver on a
//! one-slot [`TaskQueue`], so deliveries never overlap.

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;

use super::{Monitor, Task, TaskQueue, TaskStatus};
use crate::timer::Timers;

static NEXT_BUFFER: AtomicU64 = AtomicU64::new(1);

type Receiver<T> = Arc<dyn Fn(Vec<T>, &Monitor) + Send + Sync>;

struct BufferState<T> {
    items: Vec<T>,
    seen: HashSet<T>,
    sealed: bool,
    batches: u64,
}

struct BufferInner<T> {
    key: String,
    interval: Duration,
    timers: Timers,
    queue: TaskQueue,
    receiver: Receiver<T>,
    state: Mutex<BufferState<T>>,
}

/// Coalesces `add` calls made within `interval` into one receiver call.
pub struct BatchedBuffer<T> {
    inner: Arc<BufferInner<T>>,
}

impl<T> BatchedBuffer<T>
where
    T: Eq + Hash + Clone + Send + 'static,
{
    pub fn new<F>(name: &str, interval: Duration, timers: Timers, receiver: F) -> Self
    where
        F: Fn(Vec<T>, &Monitor) + Send + Sync + 'static,
    {
        let key = format!("batch:{name}#{}", NEXT_BUFFER.fetch_add(1, Ordering::Relaxed));
        Self {
            inner: Arc::new(BufferInner {
                queue: TaskQueue::new(key.clone(), 1),
                key,
                interval,
                timers,
                receiver: Arc::new(receiver),
                state: Mutex::new(BufferState {
                    items: Vec::new(),
                    seen: HashSet::new(),
                    sealed: false,
                    batches: 0,
                }),
            }),
        }
    }

    pub fn add<I>(&self, items: I)
    where
        I: IntoIterator<Item = T>,
    {
        let inner = &self.inner;
        let mut state = inner.lock();
        if state.sealed {
            return;
        }
        let arm = state.items.is_empty();
        for item in items {
            if state.seen.insert(item.clone()) {
                state.items.push(item);
            }
        }
        if arm && !state.items.is_empty() {
            let weak = Arc::downgrade(inner);
            inner.timers.schedule(&inner.key, inner.interval, move || {
                if let Some(inner) = weak.upgrade() {
                    inner.flush();
                }
            });
        }
    }

    /// Number of items waiting for the next flush.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_sealed(&self) -> bool {
        self.inner.lock().sealed
    }

    /// Reject further additions and cancel the pending flush.
    ///
    /// With `join_running` the caller also waits for a delivery that is
    /// already in progress.
    pub fn seal(&self, join_running: bool) {
        let inner = &self.inner;
        {
            let mut state = inner.lock();
            state.sealed = true;
            state.items.clear();
            state.seen.clear();
        }
        inner.timers.cancel(&inner.key);
        inner.queue.cancel(join_running);
        debug!(buffer = %inner.key, "sealed");
    }
}

impl<T> BufferInner<T>
where
    T: Eq + Hash + Clone + Send + 'static,
{
    fn lock(&self) -> MutexGuard<'_, BufferState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flush(&self) {
        let (batch, items) = {
            let mut state = self.lock();
            if state.sealed || state.items.is_empty() {
                return;
            }
            state.seen.clear();
            state.batches += 1;
            (state.batches, std::mem::take(&mut state.items))
        };
        debug!(buffer = %self.key, batch, items = items.len(), "flushing batch");
        self.queue.submit([Arc::new(Delivery {
            key: format!("{}:{batch}", self.key),
            items: Mutex::new(Some(items)),
            receiver: Arc::clone(&self.receiver),
        }) as Arc<dyn Task>]);
    }
}

struct Delivery<T> {
    key: String,
    items: Mutex<Option<Vec<T>>>,
    receiver: Receiver<T>,
}

impl<T: Send + 'static> Task for Delivery<T> {
    fn key(&self) -> &str {
        &self.key
    }

    fn name(&self) -> String {
        self.key.clone()
    }

    fn run(&self, monitor: &Monitor) -> TaskStatus {
        if monitor.is_cancelled() {
            return TaskStatus::Cancelled;
        }
        let items = self
            .items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(items) = items {
            (self.receiver)(items, monitor);
        }
        TaskStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    fn recorder() -> (Arc<Mutex<Vec<Vec<u32>>>>, impl Fn(Vec<u32>, &Monitor) + Send + Sync) {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&batches);
        (batches, move |items: Vec<u32>, _: &Monitor| {
            sink.lock().unwrap().push(items);
        })
    }

    #[test]
    fn adds_within_the_window_coalesce() {
        let timers = Timers::new("batch").unwrap();
        let (batches, receiver) = recorder();
        let buffer = BatchedBuffer::new("b", Duration::from_millis(100), timers.clone(), receiver);

        buffer.add([1]);
        thread::sleep(Duration::from_millis(1));
        buffer.add([2]);
        thread::sleep(Duration::from_millis(250));

        let seen = batches.lock().unwrap().clone();
        assert_eq!(seen, vec![vec![1, 2]]);
        timers.shutdown();
    }

    #[test]
    fn duplicates_within_a_window_are_delivered_once() {
        let timers = Timers::new("dedup").unwrap();
        let (batches, receiver) = recorder();
        let buffer = BatchedBuffer::new("b", Duration::from_millis(50), timers.clone(), receiver);

        buffer.add([7, 7]);
        buffer.add([7, 8]);
        assert_eq!(buffer.len(), 2);
        thread::sleep(Duration::from_millis(200));

        assert_eq!(*batches.lock().unwrap(), vec![vec![7, 8]]);
        timers.shutdown();
    }

    #[test]
    fn later_adds_do_not_push_the_timer_back() {
        let timers = Timers::new("fixed").unwrap();
        let delivered_at = Arc::new(Mutex::new(None));
        let d = Arc::clone(&delivered_at);
        let start = Instant::now();
        let buffer = BatchedBuffer::new(
            "b",
            Duration::from_millis(150),
            timers.clone(),
            move |_: Vec<u32>, _: &Monitor| {
                *d.lock().unwrap() = Some(start.elapsed());
            },
        );

        for i in 0..10 {
            buffer.add([i]);
            thread::sleep(Duration::from_millis(10));
        }
        thread::sleep(Duration::from_millis(300));

        let at = delivered_at.lock().unwrap().expect("delivered");
        assert!(at >= Duration::from_millis(150));
        assert!(at < Duration::from_millis(280), "timer was reset: {at:?}");
        timers.shutdown();
    }

    #[test]
    fn next_window_starts_after_a_flush() {
        let timers = Timers::new("windows").unwrap();
        let (batches, receiver) = recorder();
        let buffer = BatchedBuffer::new("b", Duration::from_millis(40), timers.clone(), receiver);

        buffer.add([1]);
        thread::sleep(Duration::from_millis(150));
        buffer.add([1]);
        thread::sleep(Duration::from_millis(150));

        assert_eq!(*batches.lock().unwrap(), vec![vec![1], vec![1]]);
        timers.shutdown();
    }

    #[test]
    fn sealed_buffer_ignores_adds_and_drops_pending_flush() {
        let timers = Timers::new("sealed").unwrap();
        let (batches, receiver) = recorder();
        let buffer = BatchedBuffer::new("b", Duration::from_millis(40), timers.clone(), receiver);

        buffer.add([1]);
        buffer.seal(true);
        buffer.add([2]);
        thread::sleep(Duration::from_millis(120));

        assert!(buffer.is_sealed());
        assert!(buffer.is_empty());
        assert!(batches.lock().unwrap().is_empty());
        timers.shutdown();
    }
}
