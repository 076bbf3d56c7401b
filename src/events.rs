//! Typed publish/subscribe channels.
//!
//! Each entity kind gets its own [`EventBus`].  Listeners are plain closures
//! invoked synchronously on the publishing thread, so they should be quick
//! and hand real work to a task queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::model::{SubscriptionId, SubscriptionPrefs};
use crate::search::{BucketCounts, SavedSearchId};

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// An observer list for events of type `E`.
pub struct EventBus<E> {
    listeners: Mutex<Vec<(ListenerId, Listener<E>)>>,
    next_id: AtomicU64,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    /// Returns `false` if the listener was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn publish(&self, event: &E) {
        // Snapshot so listeners may (un)subscribe while being notified.
        let snapshot: Vec<Listener<E>> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Subscription entity changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    PrefsChanged {
        id: SubscriptionId,
        prefs: SubscriptionPrefs,
    },
    Deleted(SubscriptionId),
    ErrorChanged {
        id: SubscriptionId,
        error: bool,
    },
}

/// Balanced begin/end notifications around one reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadEvent {
    AboutToLoad(SubscriptionId),
    DoneLoading(SubscriptionId),
}

/// Stored news changed after a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewsEvent {
    pub subscription: SubscriptionId,
    pub added: usize,
    pub updated: usize,
}

/// The search index absorbed `docs` changed documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexEvent {
    Updated { docs: usize },
}

/// A saved search's result buckets changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedSearchEvent {
    pub search: SavedSearchId,
    pub counts: BucketCounts,
}

/// All channels the engine publishes on, shared through the app context.
#[derive(Default)]
pub struct EventHub {
    pub subscriptions: EventBus<SubscriptionEvent>,
    pub loads: EventBus<LoadEvent>,
    pub news: EventBus<NewsEvent>,
    pub index: EventBus<IndexEvent>,
    pub saved_searches: EventBus<SavedSearchEvent>,
}

impl EventHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn publish_reaches_every_listener() {
        let bus = EventBus::<u32>::new();
        let sum = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let sum = Arc::clone(&sum);
            bus.subscribe(move |v| {
                sum.fetch_add(*v as usize, Ordering::SeqCst);
            });
        }
        bus.publish(&2);

        assert_eq!(sum.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn unsubscribed_listener_is_silent() {
        let bus = EventBus::<()>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let id = bus.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(&());

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(bus.listener_count(), 0);
    }
}
