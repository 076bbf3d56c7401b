//! In-memory storage backend.
//!
//! [`MemoryStore`] implements every storage contract in [`crate::ports`]:
//! subscriptions, conditional tokens, merged news with read state, icons,
//! a naive full-text index and saved searches.  The binary runs on it and
//! the tests use it as a realistic fake.
//!
//! Merging follows the live-scroll rules: items are de-duplicated by id and
//! kept newest first.  A re-fetched item with different content replaces
//! the stored copy and is marked updated.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Result};
use tracing::debug;

use crate::events::{EventHub, IndexEvent, NewsEvent};
use crate::model::{ConditionalTokens, NewsState, ParsedFeed, Subscription, SubscriptionId};
use crate::ports::{
    FeedPersistence, MergeSummary, SavedSearchStore, SearchIndex, SubscriptionStore, TokenStore,
};
use crate::search::{NewsRef, SavedSearch, SearchCondition, SearchHit};
use crate::source::FeedItem;

/// A merged item plus its read state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredNews {
    pub item: FeedItem,
    pub state: NewsState,
}

#[derive(Default)]
struct NewsList {
    /// De-duplicated, reverse-chronological items.
    items: Vec<StoredNews>,
    /// Fast lookup to avoid inserting duplicates.
    seen: HashSet<String>,
}

impl NewsList {
    fn merge(&mut self, fetched: &[FeedItem]) -> MergeSummary {
        let mut summary = MergeSummary::default();
        for item in fetched {
            if self.seen.insert(item.id.clone()) {
                self.items.push(StoredNews {
                    item: item.clone(),
                    state: NewsState::New,
                });
                summary.added += 1;
                continue;
            }
            let Some(stored) = self.items.iter_mut().find(|n| n.item.id == item.id) else {
                continue;
            };
            if stored.item.content_differs(item) {
                stored.item = item.clone();
                if stored.state != NewsState::New {
                    stored.state = NewsState::Updated;
                }
                summary.updated += 1;
            }
        }
        self.items.sort_by(|a, b| a.item.cmp(&b.item));
        summary
    }
}

#[derive(Default)]
struct StoreState {
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    tokens: HashMap<String, ConditionalTokens>,
    news: HashMap<SubscriptionId, NewsList>,
    icons: HashMap<SubscriptionId, Vec<u8>>,
    searches: Vec<SavedSearch>,
    saves: usize,
}

/// Everything in one mutex; each operation is short.
pub struct MemoryStore {
    state: Mutex<StoreState>,
    events: Arc<EventHub>,
}

impl MemoryStore {
    /// Index changes are announced on `events`.
    pub fn new(events: Arc<EventHub>) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_subscription(&self, subscription: Subscription) {
        self.lock().subscriptions.insert(subscription.id, subscription);
    }

    pub fn add_saved_search(&self, search: SavedSearch) {
        let mut state = self.lock();
        state.searches.retain(|s| s.id != search.id);
        state.searches.push(search);
    }

    /// Stored news for a subscription, newest first.
    pub fn news(&self, id: SubscriptionId) -> Vec<StoredNews> {
        self.lock()
            .news
            .get(&id)
            .map(|list| list.items.clone())
            .unwrap_or_default()
    }

    /// Change an item's read state.  Returns `false` if it is unknown.
    pub fn set_state(&self, id: SubscriptionId, item_id: &str, state: NewsState) -> bool {
        let changed = {
            let mut store = self.lock();
            let Some(stored) = store
                .news
                .get_mut(&id)
                .and_then(|list| list.items.iter_mut().find(|n| n.item.id == item_id))
            else {
                return false;
            };
            let changed = stored.state != state;
            stored.state = state;
            changed
        };
        if changed {
            self.events.index.publish(&IndexEvent::Updated { docs: 1 });
        }
        true
    }

    pub fn tokens(&self, address: &str) -> Option<ConditionalTokens> {
        self.lock().tokens.get(address).cloned()
    }

    pub fn put_tokens(&self, address: &str, tokens: ConditionalTokens) {
        self.lock().tokens.insert(address.to_string(), tokens);
    }

    pub fn icon(&self, id: SubscriptionId) -> Option<Vec<u8>> {
        self.lock().icons.get(&id).cloned()
    }

    /// Number of completed [`FeedPersistence::merge_and_save`] calls.
    pub fn save_count(&self) -> usize {
        self.lock().saves
    }
}

// -- subscriptions -----------------------------------------------------------

impl SubscriptionStore for MemoryStore {
    fn get(&self, id: SubscriptionId) -> Option<Subscription> {
        self.lock().subscriptions.get(&id).cloned()
    }

    fn all(&self) -> Vec<Subscription> {
        self.lock().subscriptions.values().cloned().collect()
    }

    fn update(&self, subscription: &Subscription) -> Result<()> {
        let mut state = self.lock();
        match state.subscriptions.get_mut(&subscription.id) {
            Some(slot) => {
                *slot = subscription.clone();
                Ok(())
            }
            None => bail!("subscription {} does not exist", subscription.id),
        }
    }

    fn remove(&self, id: SubscriptionId) -> Option<Subscription> {
        let mut state = self.lock();
        let removed = state.subscriptions.remove(&id)?;
        state.news.remove(&id);
        state.icons.remove(&id);
        Some(removed)
    }
}

impl TokenStore for MemoryStore {
    fn load(&self, address: &str) -> Option<ConditionalTokens> {
        self.tokens(address)
    }
}

// -- merge & save ------------------------------------------------------------

impl FeedPersistence for MemoryStore {
    fn merge_and_save(
        &self,
        subscription: &Subscription,
        feed: &ParsedFeed,
        tokens: Option<&ConditionalTokens>,
        delete_tokens: bool,
    ) -> Result<MergeSummary> {
        let summary = {
            let mut state = self.lock();
            if !state.subscriptions.contains_key(&subscription.id) {
                bail!("subscription {} was deleted", subscription.id);
            }
            let summary = state.news.entry(subscription.id).or_default().merge(&feed.items);
            if let Some(tokens) = tokens {
                state.tokens.insert(subscription.address.clone(), tokens.clone());
            } else if delete_tokens {
                state.tokens.remove(&subscription.address);
            }
            state.saves += 1;
            summary
        };
        debug!(
            subscription = %subscription.id,
            added = summary.added,
            updated = summary.updated,
            "merged feed"
        );

        let docs = summary.added + summary.updated;
        if docs > 0 {
            self.events.news.publish(&NewsEvent {
                subscription: subscription.id,
                added: summary.added,
                updated: summary.updated,
            });
            self.events.index.publish(&IndexEvent::Updated { docs });
        }
        Ok(summary)
    }

    fn has_icon(&self, id: SubscriptionId) -> bool {
        self.lock().icons.contains_key(&id)
    }

    fn save_icon(&self, id: SubscriptionId, bytes: Vec<u8>) -> Result<()> {
        self.lock().icons.insert(id, bytes);
        Ok(())
    }
}

// -- search ------------------------------------------------------------------

impl SearchIndex for MemoryStore {
    fn search(&self, conditions: &[SearchCondition], match_all: bool) -> Vec<SearchHit> {
        let query = SavedSearch {
            id: crate::search::SavedSearchId(0),
            name: String::new(),
            conditions: conditions.to_vec(),
            match_all,
        };
        let state = self.lock();
        state
            .news
            .iter()
            .flat_map(|(sub, list)| list.items.iter().map(move |n| (*sub, n)))
            .filter(|(sub, n)| query.matches(*sub, &n.item, n.state))
            .map(|(sub, n)| SearchHit {
                news: NewsRef {
                    subscription: sub,
                    item: n.item.id.clone(),
                },
                state: n.state,
            })
            .collect()
    }
}

impl SavedSearchStore for MemoryStore {
    fn saved_searches(&self) -> Vec<SavedSearch> {
        self.lock().searches.clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
