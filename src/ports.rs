//! Collaborator contracts the engine orchestrates.
//!
//! The network side lives in [`crate::source`]; everything else the reload
//! pipeline, the scheduler and the saved-search service touch is declared
//! here.  [`MemoryStore`](crate::store::MemoryStore) implements the storage
//! traits for the binary and the tests.

use anyhow::Result;

use crate::model::{ConditionalTokens, Credentials, ParsedFeed, Subscription, SubscriptionId};
use crate::search::{SavedSearch, SearchCondition, SearchHit};

pub use crate::source::{FeedSource, IconSource};

/// Owner of subscription entities.
pub trait SubscriptionStore: Send + Sync {
    fn get(&self, id: SubscriptionId) -> Option<Subscription>;
    fn all(&self) -> Vec<Subscription>;
    fn update(&self, subscription: &Subscription) -> Result<()>;
    fn remove(&self, id: SubscriptionId) -> Option<Subscription>;
}

/// Read side of the conditional-token store.  Writes go through
/// [`FeedPersistence::merge_and_save`] on the save queue.
pub trait TokenStore: Send + Sync {
    fn load(&self, address: &str) -> Option<ConditionalTokens>;
}

/// Credentials owned by the UI.
pub trait CredentialsProvider: Send + Sync {
    /// Credentials known for a normalized address and realm.
    fn credentials(&self, normalized_address: &str, realm: Option<&str>) -> Option<Credentials>;

    /// Show a modal login prompt.  Accepted credentials must be remembered
    /// so later [`credentials`](Self::credentials) lookups return them.
    /// `None` means the user cancelled.
    fn prompt_login(&self, address: &str, realm: Option<&str>) -> Option<Credentials>;
}

/// What a merge changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub added: usize,
    pub updated: usize,
}

/// Persistence and merge of reloaded feeds.  Only ever called from the
/// single-slot save queue.
pub trait FeedPersistence: Send + Sync {
    /// Merge `feed` into the subscription's stored news and persist the
    /// token change: store `tokens` when given, delete the record when
    /// `delete_tokens` is set.
    fn merge_and_save(
        &self,
        subscription: &Subscription,
        feed: &ParsedFeed,
        tokens: Option<&ConditionalTokens>,
        delete_tokens: bool,
    ) -> Result<MergeSummary>;

    fn has_icon(&self, id: SubscriptionId) -> bool;

    fn save_icon(&self, id: SubscriptionId, bytes: Vec<u8>) -> Result<()>;
}

/// Query side of the full-text index.
pub trait SearchIndex: Send + Sync {
    fn search(&self, conditions: &[SearchCondition], match_all: bool) -> Vec<SearchHit>;
}

pub trait SavedSearchStore: Send + Sync {
    fn saved_searches(&self) -> Vec<SavedSearch>;
}

/// UI hook that opens feed views at startup.
pub trait FeedViewOpener: Send + Sync {
    fn open(&self, subscriptions: &[Subscription]);
}
