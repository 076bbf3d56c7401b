//! Saved searches and the service that keeps their results current.
//!
//! A saved search is a stored query.  Its hits are partitioned into three
//! buckets (read, unread-or-updated, new) and a snapshot of each bucket is
//! kept so the UI is only told about searches whose buckets actually
//! changed.
//!
//! Recomputing is expensive, so index notifications are coalesced: the
//! first notification arms one timer, later ones are ignored until that
//! pass has finished.  A single-document change waits a short delay, a
//! bulk change waits longer.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tracing::{debug, info};

use crate::events::{EventHub, IndexEvent, ListenerId, SavedSearchEvent};
use crate::model::{NewsState, SubscriptionId};
use crate::ports::{SavedSearchStore, SearchIndex};
use crate::source::FeedItem;
use crate::task::{Monitor, Task, TaskQueue, TaskStatus};
use crate::timer::Timers;

// ---------------------------------------------------------------------------
// Queries and hits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SavedSearchId(pub u64);

/// One clause of a saved search.  Text matches are case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchCondition {
    TitleContains(String),
    /// Title or description.
    TextContains(String),
    StateIs(NewsState),
    InSubscription(SubscriptionId),
}

impl SearchCondition {
    pub fn matches(&self, subscription: SubscriptionId, item: &FeedItem, state: NewsState) -> bool {
        match self {
            Self::TitleContains(needle) => contains_ci(&item.title, needle),
            Self::TextContains(needle) => {
                contains_ci(&item.title, needle)
                    || item
                        .description
                        .as_deref()
                        .is_some_and(|d| contains_ci(d, needle))
            }
            Self::StateIs(wanted) => *wanted == state,
            Self::InSubscription(id) => *id == subscription,
        }
    }
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedSearch {
    pub id: SavedSearchId,
    pub name: String,
    pub conditions: Vec<SearchCondition>,
    /// `true`: every condition must hold; `false`: any one suffices.
    pub match_all: bool,
}

impl SavedSearch {
    pub fn matches(&self, subscription: SubscriptionId, item: &FeedItem, state: NewsState) -> bool {
        let mut conditions = self.conditions.iter();
        if self.match_all {
            conditions.all(|c| c.matches(subscription, item, state))
        } else {
            conditions.any(|c| c.matches(subscription, item, state))
        }
    }
}

/// Reference to one stored news item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NewsRef {
    pub subscription: SubscriptionId,
    pub item: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub news: NewsRef,
    pub state: NewsState,
}

/// A saved search's result, partitioned by read state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchBuckets {
    pub read: HashSet<NewsRef>,
    pub unread_or_updated: HashSet<NewsRef>,
    pub new: HashSet<NewsRef>,
}

impl SearchBuckets {
    pub fn partition(hits: impl IntoIterator<Item = SearchHit>) -> Self {
        let mut buckets = Self::default();
        for hit in hits {
            let bucket = match hit.state {
                NewsState::Read => &mut buckets.read,
                NewsState::Unread | NewsState::Updated => &mut buckets.unread_or_updated,
                NewsState::New => &mut buckets.new,
            };
            bucket.insert(hit.news);
        }
        buckets
    }

    pub fn counts(&self) -> BucketCounts {
        BucketCounts {
            read: self.read.len(),
            unread_or_updated: self.unread_or_updated.len(),
            new: self.new.len(),
        }
    }

    /// Replace every bucket that differs from `fresh`.  Returns `true` if
    /// anything was replaced.
    fn absorb(&mut self, fresh: SearchBuckets) -> bool {
        let mut changed = false;
        for (mine, theirs) in [
            (&mut self.read, fresh.read),
            (&mut self.unread_or_updated, fresh.unread_or_updated),
            (&mut self.new, fresh.new),
        ] {
            if *mine != theirs {
                *mine = theirs;
                changed = true;
            }
        }
        changed
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketCounts {
    pub read: usize,
    pub unread_or_updated: usize,
    pub new: usize,
}

// ---------------------------------------------------------------------------
// Recompute service
// ---------------------------------------------------------------------------

/// How long to wait after an index notification before recomputing.
#[derive(Debug, Clone, Copy)]
pub struct RecomputeDelays {
    /// After a change to a single document.
    pub single: Duration,
    /// After a bulk change.
    pub bulk: Duration,
}

impl Default for RecomputeDelays {
    fn default() -> Self {
        Self {
            single: Duration::from_millis(200),
            bulk: Duration::from_millis(2000),
        }
    }
}

impl RecomputeDelays {
    pub fn for_docs(&self, docs: usize) -> Duration {
        if docs <= 1 {
            self.single
        } else {
            self.bulk
        }
    }
}

struct ServiceInner {
    index: Arc<dyn SearchIndex>,
    store: Arc<dyn SavedSearchStore>,
    events: Arc<EventHub>,
    timers: Timers,
    queue: TaskQueue,
    delays: RecomputeDelays,
    timer_key: String,
    snapshots: Mutex<HashMap<SavedSearchId, SearchBuckets>>,
    /// A notification-triggered pass is armed or running.
    scheduled: AtomicBool,
    ran_once: AtomicBool,
    sealed: AtomicBool,
    passes: AtomicUsize,
}

/// Keeps saved-search result snapshots in step with the search index.
#[derive(Clone)]
pub struct SavedSearchService {
    inner: Arc<ServiceInner>,
}

impl SavedSearchService {
    pub fn new(
        index: Arc<dyn SearchIndex>,
        store: Arc<dyn SavedSearchStore>,
        events: Arc<EventHub>,
        timers: Timers,
        delays: RecomputeDelays,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                index,
                store,
                events,
                timers,
                queue: TaskQueue::new("Saved Searches", 1),
                delays,
                timer_key: "saved-search-recompute".into(),
                snapshots: Mutex::new(HashMap::new()),
                scheduled: AtomicBool::new(false),
                ran_once: AtomicBool::new(false),
                sealed: AtomicBool::new(false),
                passes: AtomicUsize::new(0),
            }),
        }
    }

    /// Listen to index notifications on the shared event hub.
    pub fn attach(&self) -> ListenerId {
        let weak: Weak<ServiceInner> = Arc::downgrade(&self.inner);
        self.inner.events.index.subscribe(move |event| {
            if let Some(inner) = weak.upgrade() {
                let IndexEvent::Updated { docs } = *event;
                inner.on_index_updated(docs);
            }
        })
    }

    /// React to `docs` documents changing in the index.
    pub fn on_index_updated(&self, docs: usize) {
        self.inner.on_index_updated(docs);
    }

    /// Queue a pass.  An unforced pass is skipped when one has already run.
    pub fn update_all(&self, force: bool) {
        self.inner.submit(force, false);
    }

    /// Run a pass on the calling thread.  Returns how many searches
    /// changed.
    pub fn recompute_now(&self, force: bool) -> usize {
        self.inner.recompute(force, &Monitor::new())
    }

    pub fn buckets(&self, id: SavedSearchId) -> Option<SearchBuckets> {
        self.inner.lock_snapshots().get(&id).cloned()
    }

    /// Number of completed passes.
    pub fn passes(&self) -> usize {
        self.inner.passes.load(Ordering::SeqCst)
    }

    pub fn is_scheduled(&self) -> bool {
        self.inner.scheduled.load(Ordering::SeqCst)
    }

    /// Stop reacting to notifications and drop any armed pass.
    pub fn seal(&self, join_running: bool) {
        let inner = &self.inner;
        inner.sealed.store(true, Ordering::SeqCst);
        inner.timers.cancel(&inner.timer_key);
        inner.queue.cancel(join_running);
    }
}

impl ServiceInner {
    fn lock_snapshots(&self) -> std::sync::MutexGuard<'_, HashMap<SavedSearchId, SearchBuckets>> {
        self.snapshots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_index_updated(self: &Arc<Self>, docs: usize) {
        if self.sealed.load(Ordering::SeqCst) || self.scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let delay = self.delays.for_docs(docs);
        debug!(docs, ?delay, "saved-search pass armed");
        let weak = Arc::downgrade(self);
        self.timers.schedule(&self.timer_key, delay, move || {
            if let Some(inner) = weak.upgrade() {
                inner.submit(true, true);
            }
        });
    }

    fn submit(self: &Arc<Self>, force: bool, from_index: bool) {
        if self.sealed.load(Ordering::SeqCst) {
            return;
        }
        let key = if from_index { "recompute:index" } else { "recompute:explicit" };
        let submitted = self.queue.submit([Arc::new(RecomputeTask {
            key,
            force,
            from_index,
            service: Arc::clone(self),
        }) as Arc<dyn Task>]);
        if submitted == 0 && from_index {
            // An identical pass is already pending and will clear the flag.
            debug!("saved-search pass already pending");
        }
    }

    fn recompute(&self, force: bool, monitor: &Monitor) -> usize {
        if !force && self.ran_once.load(Ordering::SeqCst) {
            debug!("saved searches already computed, skipping");
            return 0;
        }
        let searches = self.store.saved_searches();
        let mut changed = 0;
        for search in &searches {
            if monitor.is_cancelled() {
                return changed;
            }
            let fresh = SearchBuckets::partition(self.index.search(&search.conditions, search.match_all));
            let counts = {
                let mut snapshots = self.lock_snapshots();
                let entry = snapshots.entry(search.id).or_default();
                entry.absorb(fresh).then(|| entry.counts())
            };
            if let Some(counts) = counts {
                changed += 1;
                self.events.saved_searches.publish(&SavedSearchEvent {
                    search: search.id,
                    counts,
                });
            }
        }
        let live: HashSet<SavedSearchId> = searches.iter().map(|s| s.id).collect();
        self.lock_snapshots().retain(|id, _| live.contains(id));

        self.ran_once.store(true, Ordering::SeqCst);
        let passes = self.passes.fetch_add(1, Ordering::SeqCst) + 1;
        info!(searches = searches.len(), changed, passes, "saved searches recomputed");
        changed
    }
}

struct ClearOnDrop<'a>(&'a AtomicBool);

impl Drop for ClearOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct RecomputeTask {
    key: &'static str,
    force: bool,
    from_index: bool,
    service: Arc<ServiceInner>,
}

impl Task for RecomputeTask {
    fn key(&self) -> &str {
        self.key
    }

    fn name(&self) -> String {
        "Updating saved searches".into()
    }

    fn run(&self, monitor: &Monitor) -> TaskStatus {
        // A pass that panics must still re-open the service to notifications.
        let _rearm = self.from_index.then(|| ClearOnDrop(&self.service.scheduled));
        self.service.recompute(self.force, monitor);
        if monitor.is_cancelled() {
            TaskStatus::Cancelled
        } else {
            TaskStatus::Ok
        }
    }
}
