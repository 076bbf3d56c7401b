//! Entities shared by the reload pipeline, the scheduler and the stores.

use std::fmt;

use url::Url;

use crate::source::FeedItem;

/// Stable identity of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Per-subscription reload preferences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionPrefs {
    pub auto_update: bool,
    pub interval_secs: u64,
    pub reload_on_startup: bool,
    pub open_on_startup: bool,
}

impl Default for SubscriptionPrefs {
    fn default() -> Self {
        Self {
            auto_update: true,
            interval_secs: 30 * 60,
            reload_on_startup: false,
            open_on_startup: false,
        }
    }
}

/// A followed feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub name: String,
    /// Feed address as entered by the user.
    pub address: String,
    /// Set when the last reload failed for a reason other than
    /// authentication or not-modified.
    pub error: bool,
    pub error_message: Option<String>,
    /// Authentication realm the user accepted a login for.
    pub realm: Option<String>,
    pub prefs: SubscriptionPrefs,
}

impl Subscription {
    pub fn new(id: SubscriptionId, name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            address: address.into(),
            error: false,
            error_message: None,
            realm: None,
            prefs: SubscriptionPrefs::default(),
        }
    }
}

/// Cache validators remembered between two fetches of the same address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConditionalTokens {
    pub last_modified: Option<String>,
    pub etag: Option<String>,
}

impl ConditionalTokens {
    /// Build tokens from response headers; `None` when the server sent no
    /// caching hints at all.
    pub fn from_parts(last_modified: Option<String>, etag: Option<String>) -> Option<Self> {
        if last_modified.is_none() && etag.is_none() {
            None
        } else {
            Some(Self { last_modified, etag })
        }
    }
}

/// A username/password pair for a protected feed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Read state of a stored news item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NewsState {
    New,
    Unread,
    Updated,
    Read,
}

/// A downloaded and interpreted feed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedFeed {
    pub title: String,
    /// Website the feed belongs to; used to look for an icon.
    pub homepage: Option<String>,
    pub items: Vec<FeedItem>,
}

/// Reduce a feed address to its origin (`scheme://host[:port]`).
///
/// Credentials are kept per origin and realm, so two feeds on the same host
/// share one login.  Addresses that do not parse are returned trimmed.
pub fn normalize_address(address: &str) -> String {
    match Url::parse(address.trim()) {
        Ok(url) if url.has_host() => url.origin().ascii_serialization(),
        _ => address.trim().to_string(),
    }
}
