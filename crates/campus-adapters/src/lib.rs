//! Source fetcher contracts plus the RSS, calendar and email fetchers.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use campus_core::{EventSource, RawCandidate};
use campus_storage::{HttpError, HttpFetcher};
use chrono::{DateTime, Utc};
use scraper::{ElementRef, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod calendar;
pub mod email;
pub mod rss;

pub use calendar::{parse_calendar_page, CalendarFetcher, CalendarInput};
pub use email::{
    ChatCompletionExtractor, DirectoryMailbox, EmailFetcher, EventExtractor, ExtractedEvent,
    JsonFileExtractor, MailMessage, Mailbox,
};
pub use rss::{parse_feed, FeedInput, RssFetcher};

#[derive(Debug, Clone)]
pub struct FetchContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
    pub http: HttpFetcher,
}

/// Raw payload kept for audit. The cycle writes it to the snapshot store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSnapshot {
    pub extension: String,
    pub bytes: Vec<u8>,
}

impl RawSnapshot {
    pub fn new(extension: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            extension: extension.into(),
            bytes: bytes.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchOutput {
    pub candidates: Vec<RawCandidate>,
    pub snapshots: Vec<RawSnapshot>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse error: {0}")]
    Parse(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("extraction failed: {0}")]
    Extraction(String),
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Http(err) if err.is_timeout())
    }
}

/// One configured external source. A failing fetch skips only this source for the cycle.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    fn source_id(&self) -> &str;
    fn kind(&self) -> EventSource;

    async fn fetch(&self, ctx: &FetchContext) -> Result<FetchOutput, FetchError>;
}

pub(crate) async fn read_source_file(path: &Path) -> Result<Vec<u8>, FetchError> {
    tokio::fs::read(path).await.map_err(|source| FetchError::Io {
        path: path.to_path_buf(),
        source,
    })
}

pub(crate) fn selector(css: &str) -> Result<Selector, FetchError> {
    Selector::parse(css).map_err(|e| FetchError::Parse(format!("selector `{css}`: {e}")))
}

pub(crate) fn text_or_none(value: impl AsRef<str>) -> Option<String> {
    let trimmed = value.as_ref().trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub(crate) fn first_text(scope: ElementRef<'_>, sel: &Selector) -> Option<String> {
    scope
        .select(sel)
        .next()
        .and_then(|node| text_or_none(node.text().collect::<Vec<_>>().join(" ")))
}

pub(crate) fn first_attr(scope: ElementRef<'_>, sel: &Selector, attr: &str) -> Option<String> {
    scope
        .select(sel)
        .next()
        .and_then(|node| node.value().attr(attr))
        .and_then(text_or_none)
}

/// Joins a site-relative path onto `base`; absolute URLs pass through.
pub(crate) fn absolutize(base: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else if href.starts_with('/') {
        format!("{}{}", base.trim_end_matches('/'), href)
    } else {
        format!("{}/{}", base.trim_end_matches('/'), href)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolutize_handles_relative_and_absolute() {
        assert_eq!(
            absolutize("https://www.amherst.edu/", "/system/files/a.jpg"),
            "https://www.amherst.edu/system/files/a.jpg"
        );
        assert_eq!(
            absolutize("https://www.amherst.edu", "https://cdn.example.com/b.png"),
            "https://cdn.example.com/b.png"
        );
    }

    #[test]
    fn blank_text_is_none() {
        assert_eq!(text_or_none("   "), None);
        assert_eq!(text_or_none("  Keefe  "), Some("Keefe".to_string()));
    }

    #[test]
    fn io_errors_name_the_path() {
        let err = FetchError::Io {
            path: PathBuf::from("fixtures/missing.xml"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        };
        assert!(err.to_string().contains("fixtures/missing.xml"));
        assert!(!err.is_timeout());
    }
}
