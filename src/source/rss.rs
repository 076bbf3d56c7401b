//! RSS feed source implementation.
//!
//! Fetches RSS 2.0 over HTTP with [`reqwest`]'s blocking client and parses
//! it with the [`rss`] crate.  Requests are conditional: stored
//! `Last-Modified`/`ETag` values go out as `If-Modified-Since` and
//! `If-None-Match`, and a `304` comes back as
//! [`FetchOutcome::NotModified`].

use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use reqwest::blocking::{Client, Response};
use reqwest::header::{
    HeaderName, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, WWW_AUTHENTICATE,
};
use reqwest::StatusCode;
use tracing::debug;

use super::{FeedItem, FeedSource, FetchOutcome, FetchRequest, IconSource};
use crate::error::ReloadError;
use crate::model::{normalize_address, ConditionalTokens, ParsedFeed};

/// An RSS feed source shared by every subscription.
#[derive(Clone)]
pub struct RssSource {
    client: Client,
}

impl RssSource {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build HTTP client")?;
        Ok(Self { client })
    }

    /// Parse an already-fetched [`rss::Channel`] into [`FeedItem`]s.
    ///
    /// This is a pure function (no I/O) so that tests can exercise the
    /// parsing logic without hitting the network.
    pub fn parse_channel(channel: &rss::Channel, label: &str) -> Vec<FeedItem> {
        channel
            .items()
            .iter()
            .map(|item| {
                // Prefer <guid>, fall back to <link>, then empty string.
                let id = item
                    .guid()
                    .map(|g| g.value().to_string())
                    .or_else(|| item.link().map(String::from))
                    .unwrap_or_default();

                // Parse RFC-2822 date; gracefully degrade to None on failure.
                let published = item
                    .pub_date()
                    .and_then(|d| DateTime::parse_from_rfc2822(d).ok())
                    .map(|dt| dt.with_timezone(&Utc));

                FeedItem {
                    id,
                    title: item.title().unwrap_or("(untitled)").to_string(),
                    description: item.description().map(String::from),
                    link: item.link().map(String::from),
                    published,
                    source_name: label.to_string(),
                }
            })
            .collect()
    }

    /// Interpret a whole channel: title, homepage and items.
    pub fn parse_feed(channel: &rss::Channel) -> ParsedFeed {
        let title = channel.title().trim().to_string();
        let homepage = Some(channel.link().trim())
            .filter(|l| !l.is_empty())
            .map(String::from);
        ParsedFeed {
            items: Self::parse_channel(channel, &title),
            title,
            homepage,
        }
    }
}

fn header(response: &Response, name: HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

/// Pull the realm out of a `WWW-Authenticate` challenge such as
/// `Basic realm="Members only"`.
pub fn parse_realm(challenge: &str) -> Option<String> {
    let lower = challenge.to_ascii_lowercase();
    let start = lower.find("realm=")? + "realm=".len();
    let rest = &challenge[start..];
    let realm = match rest.strip_prefix('"') {
        Some(quoted) => quoted.split('"').next()?,
        None => rest.split([',', ' ']).next()?,
    };
    Some(realm.to_string()).filter(|r| !r.is_empty())
}

impl FeedSource for RssSource {
    fn fetch(&self, request: &FetchRequest<'_>) -> Result<FetchOutcome, ReloadError> {
        let mut builder = self.client.get(request.address).timeout(request.timeout);
        if let Some(tokens) = request.tokens {
            if let Some(last_modified) = &tokens.last_modified {
                builder = builder.header(IF_MODIFIED_SINCE, last_modified.as_str());
            }
            if let Some(etag) = &tokens.etag {
                builder = builder.header(IF_NONE_MATCH, etag.as_str());
            }
        }
        if let Some(creds) = request.credentials {
            builder = builder.basic_auth(&creds.username, Some(&creds.password));
        }

        let response = builder
            .send()
            .map_err(|e| ReloadError::Connection(e.to_string()))?;
        let status = response.status();
        debug!(address = request.address, %status, "feed response");

        if status == StatusCode::NOT_MODIFIED {
            return Ok(FetchOutcome::NotModified);
        }
        if status == StatusCode::UNAUTHORIZED {
            let realm = header(&response, WWW_AUTHENTICATE).and_then(|c| parse_realm(&c));
            return Err(ReloadError::AuthenticationRequired { realm });
        }
        if !status.is_success() {
            return Err(ReloadError::Connection(format!("HTTP {status}")));
        }

        let tokens =
            ConditionalTokens::from_parts(header(&response, LAST_MODIFIED), header(&response, ETAG));
        let body = response
            .bytes()
            .map_err(|e| ReloadError::Connection(e.to_string()))?;
        let channel = rss::Channel::read_from(body.as_ref())
            .map_err(|e| ReloadError::Parse(e.to_string()))?;

        Ok(FetchOutcome::Fetched {
            feed: Self::parse_feed(&channel),
            tokens,
        })
    }
}

impl IconSource for RssSource {
    fn fetch_icon(&self, address: &str, timeout: Duration) -> anyhow::Result<Vec<u8>> {
        let url = format!("{}/favicon.ico", normalize_address(address));
        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .with_context(|| format!("request {url}"))?;
        if !response.status().is_success() {
            bail!("icon request {url} returned {}", response.status());
        }
        let bytes = response.bytes().context("read icon body")?;
        if bytes.is_empty() {
            bail!("icon at {url} is empty");
        }
        Ok(bytes.to_vec())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_channel_extracts_items() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Test Feed</title>
    <link>https://example.com/</link>
    <item>
      <title>First Post</title>
      <link>https://example.com/1</link>
      <guid>guid-1</guid>
      <pubDate>Mon, 01 Jan 2024 00:00:00 +0000</pubDate>
      <description>First description</description>
    </item>
    <item>
      <title>Second Post</title>
      <link>https://example.com/2</link>
      <guid>guid-2</guid>
      <pubDate>Tue, 02 Jan 2024 12:00:00 +0000</pubDate>
    </item>
  </channel>
</rss>"#;

        let channel = rss::Channel::read_from(xml.as_bytes()).unwrap();
        let feed = RssSource::parse_feed(&channel);

        assert_eq!(feed.title, "Test Feed");
        assert_eq!(feed.homepage.as_deref(), Some("https://example.com/"));
        assert_eq!(feed.items.len(), 2);

        assert_eq!(feed.items[0].id, "guid-1");
        assert_eq!(feed.items[0].title, "First Post");
        assert_eq!(feed.items[0].description.as_deref(), Some("First description"));
        assert_eq!(feed.items[0].source_name, "Test Feed");
        assert!(feed.items[0].published.is_some());

        assert_eq!(feed.items[1].id, "guid-2");
        assert!(feed.items[1].description.is_none());
    }

    #[test]
    fn falls_back_to_link_when_no_guid() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Test</title>
    <item>
      <title>No GUID</title>
      <link>https://example.com/no-guid</link>
    </item>
  </channel>
</rss>"#;

        let channel = rss::Channel::read_from(xml.as_bytes()).unwrap();
        let items = RssSource::parse_channel(&channel, "t");

        assert_eq!(items[0].id, "https://example.com/no-guid");
    }

    #[test]
    fn handles_missing_title_and_invalid_date() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Test</title>
    <item>
      <guid>g1</guid>
      <pubDate>not-a-real-date</pubDate>
    </item>
  </channel>
</rss>"#;

        let channel = rss::Channel::read_from(xml.as_bytes()).unwrap();
        let feed = RssSource::parse_feed(&channel);

        assert_eq!(feed.items[0].title, "(untitled)");
        assert!(feed.items[0].published.is_none());
        assert!(feed.homepage.is_none());
    }

    #[test]
    fn realm_is_read_from_challenges() {
        assert_eq!(parse_realm(r#"Basic realm="Members only""#).as_deref(), Some("Members only"));
        assert_eq!(
            parse_realm(r#"Digest Realm="api", nonce="x""#).as_deref(),
            Some("api")
        );
        assert_eq!(parse_realm("Basic realm=plain, charset=UTF-8").as_deref(), Some("plain"));
        assert_eq!(parse_realm("Bearer"), None);
        assert_eq!(parse_realm(r#"Basic realm="""#), None);
    }
}
