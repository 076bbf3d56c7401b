//! The item type every feed source produces.
//!
//! Sources convert their native format into `FeedItem`s, so merging,
//! indexing and saved searches never need to know where an item came from.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;

/// A single feed entry, normalised from any data source.
///
/// ## Sorting
///
/// `FeedItem` implements [`Ord`] for **reverse-chronological** ordering:
/// newer items sort before older ones, and items without a date sort last.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FeedItem {
    /// Unique identifier used for de-duplication and merging.
    ///
    /// For RSS this is the `<guid>` element (falling back to `<link>`).
    pub id: String,

    /// Human-readable headline.
    pub title: String,

    /// Optional longer description or summary text.
    pub description: Option<String>,

    /// URL to the full content.
    pub link: Option<String>,

    /// Publication timestamp, used for sorting.
    pub published: Option<DateTime<Utc>>,

    /// Name of the feed this came from.
    pub source_name: String,
}

impl FeedItem {
    /// `true` when a re-fetched copy of the same item carries different
    /// content, so a merge should mark it updated.
    pub fn content_differs(&self, other: &FeedItem) -> bool {
        self.title != other.title
            || self.description != other.description
            || self.link != other.link
            || self.published != other.published
    }
}

// ---------------------------------------------------------------------------
// Ordering — reverse chronological (newest first)
// ---------------------------------------------------------------------------

impl Ord for FeedItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // `None` is less than `Some(_)`, so undated items sink to the bottom.
        other.published.cmp(&self.published)
    }
}

impl PartialOrd for FeedItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    /// Shorthand constructor for tests.
    pub fn make_item(id: &str, title: &str, published: Option<DateTime<Utc>>) -> FeedItem {
        FeedItem {
            id: id.to_string(),
            title: title.to_string(),
            description: None,
            link: None,
            published,
            source_name: "test".to_string(),
        }
    }

    #[test]
    fn sort_reverse_chronological() {
        let old = make_item("1", "Old", Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let mid = make_item("2", "Mid", Some(Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap()));
        let new = make_item("3", "New", Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));

        let mut items = vec![old, new, mid];
        items.sort();

        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["3", "2", "1"]);
    }

    #[test]
    fn undated_items_sort_after_dated() {
        let dated = make_item("1", "Dated", Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()));
        let undated = make_item("2", "Undated", None);

        let mut items = vec![undated, dated];
        items.sort();

        assert_eq!(items[0].id, "1", "dated item should come first");
        assert_eq!(items[1].id, "2", "undated item should come last");
    }

    #[test]
    fn content_differs_ignores_source_name() {
        let a = make_item("x", "Title", None);
        let mut b = a.clone();
        b.source_name = "renamed feed".into();
        assert!(!a.content_differs(&b));

        b.title = "Title (corrected)".into();
        assert!(a.content_differs(&b));
    }
}
