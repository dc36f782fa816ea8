//! Campus hub RSS 2.0 feed with the `events` namespace extension.

use std::path::PathBuf;

use async_trait::async_trait;
use campus_core::{EventSource, RawCandidate};
use chrono::{DateTime, Utc};
use scraper::Html;
use serde::Deserialize;
use tracing::{debug, info};

use crate::{
    read_source_file, selector, text_or_none, FetchContext, FetchError, FetchOutput, RawSnapshot,
    SourceFetcher,
};

#[derive(Debug, Deserialize)]
struct RssDocument {
    channel: RssChannel,
}

#[derive(Debug, Deserialize)]
struct RssChannel {
    #[serde(rename = "item", default)]
    items: Vec<RssItem>,
}

#[derive(Debug, Deserialize)]
struct RssItem {
    title: Option<String>,
    link: Option<String>,
    guid: Option<String>,
    enclosure: Option<RssEnclosure>,
    description: Option<String>,
    #[serde(rename = "category", default)]
    categories: Vec<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    author: Option<String>,
    start: Option<String>,
    end: Option<String>,
    location: Option<String>,
    #[serde(rename = "host", default)]
    hosts: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RssEnclosure {
    #[serde(rename = "@url")]
    url: Option<String>,
}

/// Where the feed body comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedInput {
    Url(String),
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct RssFetcher {
    source_id: String,
    input: FeedInput,
}

impl RssFetcher {
    pub fn new(source_id: impl Into<String>, input: FeedInput) -> Self {
        Self {
            source_id: source_id.into(),
            input,
        }
    }
}

#[async_trait]
impl SourceFetcher for RssFetcher {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> EventSource {
        EventSource::Rss
    }

    async fn fetch(&self, ctx: &FetchContext) -> Result<FetchOutput, FetchError> {
        let body = match &self.input {
            FeedInput::Url(url) => {
                ctx.http
                    .fetch_bytes(ctx.run_id, &self.source_id, url)
                    .await?
                    .body
            }
            FeedInput::File(path) => read_source_file(path).await?,
        };

        let xml = String::from_utf8_lossy(&body);
        let candidates = parse_feed(&xml, &self.source_id, ctx.fetched_at)?;
        info!(source_id = %self.source_id, items = candidates.len(), "rss feed parsed");

        Ok(FetchOutput {
            candidates,
            snapshots: vec![RawSnapshot::new("xml", body)],
        })
    }
}

/// Parses a feed body into one candidate per `<item>`.
pub fn parse_feed(
    xml: &str,
    source_id: &str,
    fetched_at: DateTime<Utc>,
) -> Result<Vec<RawCandidate>, FetchError> {
    let cleaned = scrub_html_entities(xml);
    let document: RssDocument = quick_xml::de::from_str(&cleaned)
        .map_err(|e| FetchError::Parse(format!("rss xml: {e}")))?;

    let mut out = Vec::with_capacity(document.channel.items.len());
    for item in document.channel.items {
        let mut candidate = RawCandidate::new(EventSource::Rss, source_id, fetched_at);
        candidate.external_id = item
            .link
            .as_deref()
            .or(item.guid.as_deref())
            .and_then(trailing_numeric_id);
        candidate.title = item.title.and_then(text_or_none);
        candidate.description = match item.description.as_deref() {
            Some(raw) => description_block(raw)?,
            None => None,
        };
        candidate.start = item.start.and_then(text_or_none);
        candidate.end = item.end.and_then(text_or_none);
        candidate.published = item.pub_date.and_then(text_or_none);
        candidate.location = item.location.and_then(text_or_none);
        candidate.link = item.link.and_then(text_or_none);
        candidate.picture_link = item.enclosure.and_then(|e| e.url).and_then(text_or_none);
        candidate.categories = item.categories.into_iter().filter_map(text_or_none).collect();
        candidate.hosts = item.hosts.into_iter().filter_map(text_or_none).collect();
        candidate.author = item.author.and_then(text_or_none);

        if candidate.title.is_none() {
            debug!(source_id, link = ?candidate.link, "rss item without title");
        }
        out.push(candidate);
    }
    Ok(out)
}

/// Inner HTML of the hub's `p-description` block, or the whole description when absent.
fn description_block(raw: &str) -> Result<Option<String>, FetchError> {
    let fragment = Html::parse_fragment(raw);
    let sel = selector("div.p-description")?;
    let inner = fragment
        .select(&sel)
        .next()
        .map(|node| node.inner_html())
        .unwrap_or_else(|| raw.to_string());
    Ok(text_or_none(inner))
}

/// Hub event links end in a numeric id: `https://hub.example.edu/event/10538770`.
fn trailing_numeric_id(link: &str) -> Option<String> {
    let last = link.trim().trim_end_matches('/').rsplit('/').next()?;
    if !last.is_empty() && last.chars().all(|c| c.is_ascii_digit()) {
        Some(last.to_string())
    } else {
        None
    }
}

/// HTML entities XML does not define. CDATA content is unaffected in meaning.
fn scrub_html_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
        .replace("&hellip;", "...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const FEED: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<rss version="2.0">
  <channel>
    <title>Public Events</title>
    <category>Public Events</category>
    <link>https://hub.example.edu/events</link>
    <item>
      <title>Queer Talk</title>
      <guid>https://hub.example.edu/event/10538770</guid>
      <link>https://hub.example.edu/event/10538770</link>
      <enclosure url="https://images.example.com/queer-talk.png?preset=med-w" length="1" type="image/jpeg" />
      <description><![CDATA[<div class="h-event vevent">
        <div class="p-name summary">Queer Talk</div>
        <div class="p-description description"><p>Join us at the QRC. Don&rsquo;t miss it!!</p></div>
      </div>]]></description>
      <category>Social</category>
      <pubDate>Fri, 18 Oct 2024 02:21:19 GMT</pubDate>
      <start xmlns="events">Fri, 18 Oct 2024 20:00:00 GMT</start>
      <end xmlns="events">Fri, 18 Oct 2024 21:00:00 GMT</end>
      <location xmlns="events">Queer Resource Center (Keefe 213)</location>
      <status xmlns="events">confirmed</status>
      <host xmlns="events">Queer Resource Center</host>
    </item>
    <item>
      <title>Amherst Cricket Club Practices</title>
      <link>https://hub.example.edu/event/10428285</link>
      <description>Practice&nbsp;details</description>
      <category>Athletics</category>
      <category>Meeting</category>
      <pubDate>Fri, 18 Oct 2024 02:21:19 GMT</pubDate>
      <start xmlns="events">Sat, 19 Oct 2024 19:00:00 GMT</start>
      <end xmlns="events">Sat, 19 Oct 2024 20:00:00 GMT</end>
      <location xmlns="events">Amherst Alumni Gym (Coolidge Cage)</location>
      <author>cricket@example.edu (Amherst College Cricket Club)</author>
      <host xmlns="events">Amherst College Cricket Club</host>
    </item>
  </channel>
</rss>"#;

    fn fetched_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, 18, 3, 0, 0).single().unwrap()
    }

    #[test]
    fn parses_items_with_namespace_fields() {
        let items = parse_feed(FEED, "hub-rss", fetched_at()).expect("parse");
        assert_eq!(items.len(), 2);

        let talk = &items[0];
        assert_eq!(talk.source, EventSource::Rss);
        assert_eq!(talk.title.as_deref(), Some("Queer Talk"));
        assert_eq!(talk.external_id.as_deref(), Some("10538770"));
        assert_eq!(talk.start.as_deref(), Some("Fri, 18 Oct 2024 20:00:00 GMT"));
        assert_eq!(talk.end.as_deref(), Some("Fri, 18 Oct 2024 21:00:00 GMT"));
        assert_eq!(talk.location.as_deref(), Some("Queer Resource Center (Keefe 213)"));
        assert_eq!(
            talk.picture_link.as_deref(),
            Some("https://images.example.com/queer-talk.png?preset=med-w")
        );
        assert_eq!(talk.categories, vec!["Social".to_string()]);
        assert_eq!(talk.hosts, vec!["Queer Resource Center".to_string()]);
        assert!(talk.author.is_none());

        let description = talk.description.as_deref().expect("description");
        assert!(description.starts_with("<p>Join us at the QRC."));
        assert!(!description.contains("p-name"));
    }

    #[test]
    fn multiple_categories_author_and_entities() {
        let items = parse_feed(FEED, "hub-rss", fetched_at()).expect("parse");
        let cricket = &items[1];
        assert_eq!(cricket.categories, vec!["Athletics".to_string(), "Meeting".to_string()]);
        assert_eq!(
            cricket.author.as_deref(),
            Some("cricket@example.edu (Amherst College Cricket Club)")
        );
        assert_eq!(cricket.description.as_deref(), Some("Practice details"));
        assert!(cricket.picture_link.is_none());
    }

    #[test]
    fn empty_channel_yields_no_candidates() {
        let xml = r#"<rss version="2.0"><channel><title>Nothing</title></channel></rss>"#;
        assert!(parse_feed(xml, "hub-rss", fetched_at()).expect("parse").is_empty());
    }

    #[test]
    fn malformed_xml_is_a_parse_error() {
        let err = parse_feed("<rss><channel>", "hub-rss", fetched_at()).expect_err("truncated");
        assert!(matches!(err, FetchError::Parse(_)));
    }

    #[test]
    fn numeric_id_only_from_trailing_segment() {
        assert_eq!(
            trailing_numeric_id("https://hub.example.edu/event/42/"),
            Some("42".to_string())
        );
        assert_eq!(trailing_numeric_id("https://hub.example.edu/events"), None);
    }
}
