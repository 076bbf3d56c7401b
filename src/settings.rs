//! Process-wide tuning and the feeds file.
//!
//! [`Settings`] holds the knobs that can be overridden from the environment
//! at startup.  Anything absent, unparsable or non-positive falls back to the
//! built-in default.  The feeds file is a small TOML document listing the
//! subscriptions the binary follows.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::model::{Subscription, SubscriptionId, SubscriptionPrefs};

/// Environment variable overriding [`Settings::max_concurrent_reload_jobs`].
pub const ENV_MAX_CONCURRENT_RELOAD_JOBS: &str = "LIVESCROLL_MAX_CONCURRENT_RELOAD_JOBS";

/// Environment variable overriding [`Settings::connection_timeout`] (milliseconds).
pub const ENV_CONNECTION_TIMEOUT_MS: &str = "LIVESCROLL_CONNECTION_TIMEOUT_MS";

/// Default number of feeds reloaded at the same time.
pub const DEFAULT_MAX_CONCURRENT_RELOAD_JOBS: usize = 10;

/// Default connection timeout for a single feed download.
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 30_000;

/// Process-wide settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Upper bound on concurrently running reloads.
    pub max_concurrent_reload_jobs: usize,
    /// Timeout handed to the network layer for each fetch.
    pub connection_timeout: Duration,
    /// How long a reload batch must run before its progress becomes visible.
    pub progress_delay: Duration,
    /// Cap on subscriptions handed to the view opener at startup.
    pub max_open_on_startup: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent_reload_jobs: DEFAULT_MAX_CONCURRENT_RELOAD_JOBS,
            connection_timeout: Duration::from_millis(DEFAULT_CONNECTION_TIMEOUT_MS),
            progress_delay: Duration::from_millis(800),
            max_open_on_startup: 5,
        }
    }
}

impl Settings {
    /// Read overrides from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through `lookup`, so tests need not touch the real
    /// environment.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        if let Some(jobs) = positive(lookup(ENV_MAX_CONCURRENT_RELOAD_JOBS)) {
            settings.max_concurrent_reload_jobs = jobs as usize;
        }
        if let Some(ms) = positive(lookup(ENV_CONNECTION_TIMEOUT_MS)) {
            settings.connection_timeout = Duration::from_millis(ms);
        }
        settings
    }
}

fn positive(raw: Option<String>) -> Option<u64> {
    raw?.trim().parse::<i64>().ok().filter(|v| *v > 0).map(|v| v as u64)
}

// ---------------------------------------------------------------------------
// Feeds file
// ---------------------------------------------------------------------------

/// One `[[feed]]` table of the feeds file.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_true")]
    pub auto_update: bool,
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default)]
    pub reload_on_startup: bool,
    #[serde(default)]
    pub open_on_startup: bool,
}

fn default_true() -> bool {
    true
}

fn default_interval() -> u64 {
    SubscriptionPrefs::default().interval_secs
}

/// The whole feeds file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedsFile {
    #[serde(default, rename = "feed")]
    pub feeds: Vec<FeedConfig>,
}

impl FeedsFile {
    /// Parse a feeds file from disk.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read feeds file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parse feeds file {}", path.display()))
    }

    /// Parse a feeds file from a string.
    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Turn the configured feeds into subscriptions with sequential ids.
    pub fn into_subscriptions(self) -> Vec<Subscription> {
        self.feeds
            .into_iter()
            .enumerate()
            .map(|(i, feed)| {
                let name = feed.name.clone().unwrap_or_else(|| feed.url.clone());
                let mut sub = Subscription::new(SubscriptionId(i as u64 + 1), name, feed.url);
                sub.prefs = SubscriptionPrefs {
                    auto_update: feed.auto_update,
                    interval_secs: feed.interval_secs,
                    reload_on_startup: feed.reload_on_startup,
                    open_on_startup: feed.open_on_startup,
                };
                sub
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let settings = Settings::from_lookup(lookup(&[]));
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.max_concurrent_reload_jobs, 10);
        assert_eq!(settings.connection_timeout, Duration::from_secs(30));
    }

    #[test]
    fn positive_overrides_are_applied() {
        let settings = Settings::from_lookup(lookup(&[
            (ENV_MAX_CONCURRENT_RELOAD_JOBS, "4"),
            (ENV_CONNECTION_TIMEOUT_MS, " 1500 "),
        ]));
        assert_eq!(settings.max_concurrent_reload_jobs, 4);
        assert_eq!(settings.connection_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn non_positive_or_garbage_falls_back() {
        let settings = Settings::from_lookup(lookup(&[
            (ENV_MAX_CONCURRENT_RELOAD_JOBS, "0"),
            (ENV_CONNECTION_TIMEOUT_MS, "soon"),
        ]));
        assert_eq!(settings.max_concurrent_reload_jobs, 10);
        assert_eq!(settings.connection_timeout, Duration::from_millis(30_000));

        let negative = Settings::from_lookup(lookup(&[(ENV_CONNECTION_TIMEOUT_MS, "-5")]));
        assert_eq!(negative.connection_timeout, Duration::from_millis(30_000));
    }

    #[test]
    fn feeds_file_fills_in_defaults() {
        let file = FeedsFile::parse(
            r#"
[[feed]]
url = "https://example.com/a.xml"
name = "A"
interval_secs = 60
reload_on_startup = true

[[feed]]
url = "https://example.com/b.xml"
auto_update = false
open_on_startup = true
"#,
        )
        .unwrap();

        let subs = file.into_subscriptions();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].id, SubscriptionId(1));
        assert_eq!(subs[0].name, "A");
        assert_eq!(subs[0].prefs.interval_secs, 60);
        assert!(subs[0].prefs.auto_update);
        assert!(subs[0].prefs.reload_on_startup);

        assert_eq!(subs[1].name, "https://example.com/b.xml");
        assert!(!subs[1].prefs.auto_update);
        assert!(subs[1].prefs.open_on_startup);
        assert_eq!(subs[1].prefs.interval_secs, SubscriptionPrefs::default().interval_secs);
    }

    #[test]
    fn feeds_file_is_read_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feeds.toml");
        std::fs::write(&path, "[[feed]]\nurl = \"https://example.com/x.xml\"\n").unwrap();

        let file = FeedsFile::from_file(&path).unwrap();
        assert_eq!(file.feeds.len(), 1);
        assert!(FeedsFile::from_file(&dir.path().join("missing.toml")).is_err());
    }
}
