//! Feed source abstraction layer.
//!
//! This module defines the [`FeedSource`] trait the reload pipeline fetches
//! through, the [`IconSource`] trait used for fallback icons, and the
//! common [`FeedItem`] type.  Concrete implementations live in sub-modules
//! (currently only [`rss`]).
//!
//! ## For contributors — adding a new source
//!
//! 1. Create a new file in this directory (e.g. `atom.rs`).
//! 2. Define a struct and implement [`FeedSource`] for it.  Map "not
//!    modified" to [`FetchOutcome::NotModified`] and failures to the
//!    matching [`ReloadError`] variant.
//! 3. Add `mod atom;` below and re-export your struct.
//! 4. Hand an instance to [`AppContext`](crate::context::AppContext).

mod feed_item;
mod rss;

pub use feed_item::FeedItem;
pub use rss::{parse_realm, RssSource};

#[cfg(test)]
pub(crate) use feed_item::tests::make_item;

use std::time::Duration;

use crate::error::ReloadError;
use crate::model::{ConditionalTokens, Credentials, ParsedFeed};

/// Everything a source needs to perform one conditional fetch.
#[derive(Debug, Clone)]
pub struct FetchRequest<'a> {
    pub address: &'a str,
    /// Validators from the previous successful fetch, if any.
    pub tokens: Option<&'a ConditionalTokens>,
    pub credentials: Option<&'a Credentials>,
    pub timeout: Duration,
}

/// Successful result of a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Fetched {
        feed: ParsedFeed,
        /// Validators returned by the server; `None` when it sent no
        /// caching hints.
        tokens: Option<ConditionalTokens>,
    },
    /// The server confirmed the stored tokens are still current.
    NotModified,
}

/// Network/parse layer used by the reload pipeline.
///
/// Called on reload worker threads, so implementations must be
/// [`Send`] + [`Sync`] and may block.
pub trait FeedSource: Send + Sync {
    fn fetch(&self, request: &FetchRequest<'_>) -> Result<FetchOutcome, ReloadError>;
}

/// Best-effort icon download for a feed address.
pub trait IconSource: Send + Sync {
    fn fetch_icon(&self, address: &str, timeout: Duration) -> anyhow::Result<Vec<u8>>;
}
