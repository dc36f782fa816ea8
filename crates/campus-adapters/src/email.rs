//! Daily digest email: a mailbox yields the newest matching message, an extractor
//! turns its text into structured events.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use campus_core::{EventSource, RawCandidate};
use chrono::{DateTime, Utc};
use mail_parser::MessageParser;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::{read_source_file, text_or_none, FetchContext, FetchError, FetchOutput, RawSnapshot, SourceFetcher};

pub const DEFAULT_CHAT_ENDPOINT: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const DEFAULT_CHAT_MODEL: &str = "meta-llama/llama-3.1-405b-instruct:free";

const EXTRACTION_INSTRUCTION: &str = r#"You will be provided an email containing many events.
Extract detailed event information and return a JSON array of event objects. Do not omit available information.
Include every field; use null when the information is missing.
Use this format for each event:
{
  "title": "Event Title",
  "pub_date": "YYYY-MM-DD",
  "starttime": "HH:MM:SS",
  "endtime": "HH:MM:SS",
  "location": "Event Location",
  "event_description": "Event Description",
  "host": ["Host Organization"],
  "link": "Event URL",
  "picture_link": "Image URL",
  "categories": ["Category 1", "Category 2"],
  "author_name": "Author Name",
  "author_email": "author@email.com"
}
Only return the JSON array."#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailMessage {
    pub id: String,
    pub subject: String,
    /// From the `Date:` header.
    pub sent_at: Option<DateTime<Utc>>,
    pub body: String,
}

/// External mail query: newest message whose subject contains the filter.
#[async_trait]
pub trait Mailbox: Send + Sync {
    async fn latest_matching(&self, subject_filter: &str) -> Result<Option<MailMessage>, FetchError>;
}

/// Opaque capability turning message text into event records.
#[async_trait]
pub trait EventExtractor: Send + Sync {
    async fn extract(&self, message: &MailMessage) -> Result<Vec<ExtractedEvent>, FetchError>;
}

/// Structured event as returned by the extraction capability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedEvent {
    pub title: Option<String>,
    /// `YYYY-MM-DD`
    pub pub_date: Option<String>,
    /// `HH:MM:SS`, relative to `pub_date`.
    pub starttime: Option<String>,
    pub endtime: Option<String>,
    pub location: Option<String>,
    pub event_description: Option<String>,
    #[serde(default)]
    pub host: Option<Vec<String>>,
    pub link: Option<String>,
    pub picture_link: Option<String>,
    #[serde(default)]
    pub categories: Option<Vec<String>>,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
}

impl ExtractedEvent {
    fn into_candidate(
        self,
        source_id: &str,
        fetched_at: DateTime<Utc>,
        message: &MailMessage,
    ) -> RawCandidate {
        let mut candidate = RawCandidate::new(EventSource::Email, source_id, fetched_at);
        candidate.external_id = Some(message.id.clone());
        candidate.title = self.title.and_then(text_or_none);
        candidate.description = self.event_description.and_then(text_or_none);
        candidate.start = self.starttime.and_then(text_or_none);
        candidate.end = self.endtime.and_then(text_or_none);
        candidate.published = self
            .pub_date
            .and_then(text_or_none)
            .or_else(|| message.sent_at.map(|d| d.to_rfc3339()));
        candidate.location = self.location.and_then(text_or_none);
        candidate.link = self.link.and_then(text_or_none);
        candidate.picture_link = self.picture_link.and_then(text_or_none);
        candidate.categories = self
            .categories
            .unwrap_or_default()
            .into_iter()
            .filter_map(text_or_none)
            .collect();
        candidate.hosts = self
            .host
            .unwrap_or_default()
            .into_iter()
            .filter_map(text_or_none)
            .collect();
        candidate.author_name = self.author_name.and_then(text_or_none);
        candidate.author_email = self.author_email.and_then(text_or_none);
        candidate
    }
}

pub struct EmailFetcher {
    source_id: String,
    subject_filter: String,
    mailbox: Box<dyn Mailbox>,
    extractor: Box<dyn EventExtractor>,
}

impl EmailFetcher {
    pub fn new(
        source_id: impl Into<String>,
        subject_filter: impl Into<String>,
        mailbox: Box<dyn Mailbox>,
        extractor: Box<dyn EventExtractor>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            subject_filter: subject_filter.into(),
            mailbox,
            extractor,
        }
    }
}

#[async_trait]
impl SourceFetcher for EmailFetcher {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> EventSource {
        EventSource::Email
    }

    async fn fetch(&self, ctx: &FetchContext) -> Result<FetchOutput, FetchError> {
        let Some(message) = self.mailbox.latest_matching(&self.subject_filter).await? else {
            info!(source_id = %self.source_id, filter = %self.subject_filter, "no matching email");
            return Ok(FetchOutput::default());
        };

        let events = self.extractor.extract(&message).await?;
        let snapshot = serde_json::to_vec_pretty(&events)
            .map_err(|e| FetchError::Parse(format!("encoding extracted events: {e}")))?;
        info!(
            source_id = %self.source_id,
            message = %message.id,
            events = events.len(),
            "email events extracted"
        );

        let candidates = events
            .into_iter()
            .map(|event| event.into_candidate(&self.source_id, ctx.fetched_at, &message))
            .collect();
        Ok(FetchOutput {
            candidates,
            snapshots: vec![RawSnapshot::new("json", snapshot)],
        })
    }
}

/// Message exports on disk (`.eml` or `.txt`, RFC 822 headers then body).
#[derive(Debug, Clone)]
pub struct DirectoryMailbox {
    dir: PathBuf,
}

impl DirectoryMailbox {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn message_paths(&self) -> Result<Vec<PathBuf>, FetchError> {
        let io_err = |source| FetchError::Io {
            path: self.dir.clone(),
            source,
        };
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(io_err)?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            let is_message = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("eml") || e.eq_ignore_ascii_case("txt"));
            if is_message {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

#[async_trait]
impl Mailbox for DirectoryMailbox {
    async fn latest_matching(&self, subject_filter: &str) -> Result<Option<MailMessage>, FetchError> {
        let filter = subject_filter.trim().to_lowercase();
        let mut latest: Option<MailMessage> = None;
        for path in self.message_paths().await? {
            let bytes = read_source_file(&path).await?;
            let message = parse_message(&path, &bytes);
            if !message.subject.to_lowercase().contains(&filter) {
                continue;
            }
            let newer = match &latest {
                None => true,
                Some(current) => message.sent_at >= current.sent_at,
            };
            if newer {
                latest = Some(message);
            }
        }
        debug!(dir = %self.dir.display(), found = latest.is_some(), "mailbox scanned");
        Ok(latest)
    }
}

/// Decodes transfer encodings and charsets. The body is the first text part, found
/// through nested multiparts, with `text/plain` preferred over rendered HTML.
fn parse_message(path: &Path, raw: &[u8]) -> MailMessage {
    let id = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();
    let Some(parsed) = MessageParser::default().parse(raw) else {
        warn!(path = %path.display(), "unreadable message skipped");
        return MailMessage {
            id,
            subject: String::new(),
            sent_at: None,
            body: String::new(),
        };
    };

    MailMessage {
        id,
        subject: parsed.subject().unwrap_or_default().trim().to_string(),
        sent_at: parsed
            .date()
            .and_then(|date| DateTime::<Utc>::from_timestamp(date.to_timestamp(), 0)),
        body: parsed
            .body_text(0)
            .map(|text| text.trim().to_string())
            .unwrap_or_default(),
    }
}

/// OpenAI-compatible chat completion endpoint.
#[derive(Debug, Clone)]
pub struct ChatCompletionExtractor {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl ChatCompletionExtractor {
    pub fn new(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            model: model.into(),
            api_key,
        }
    }

    /// Reads `CAMPUS_LLM_ENDPOINT`, `CAMPUS_LLM_MODEL` and `CAMPUS_LLM_API_KEY`
    /// (falling back to `OPENROUTER_API_KEY`).
    pub fn from_env(client: reqwest::Client) -> Self {
        let api_key = std::env::var("CAMPUS_LLM_API_KEY")
            .or_else(|_| std::env::var("OPENROUTER_API_KEY"))
            .ok()
            .filter(|k| !k.trim().is_empty());
        Self::new(
            client,
            std::env::var("CAMPUS_LLM_ENDPOINT").unwrap_or_else(|_| DEFAULT_CHAT_ENDPOINT.to_string()),
            std::env::var("CAMPUS_LLM_MODEL").unwrap_or_else(|_| DEFAULT_CHAT_MODEL.to_string()),
            api_key,
        )
    }
}

#[async_trait]
impl EventExtractor for ChatCompletionExtractor {
    async fn extract(&self, message: &MailMessage) -> Result<Vec<ExtractedEvent>, FetchError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| FetchError::Auth("no extraction API key configured".into()))?;

        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": EXTRACTION_INSTRUCTION},
                {"role": "user", "content": message.body},
            ],
        });
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| FetchError::Http(e.into()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(FetchError::Auth(format!("extraction endpoint returned {status}")));
        }
        if !status.is_success() {
            return Err(FetchError::Extraction(format!("extraction endpoint returned {status}")));
        }

        let body: JsonValue = response
            .json()
            .await
            .map_err(|e| FetchError::Extraction(format!("response body: {e}")))?;
        parse_completion(&body)
    }
}

fn parse_completion(body: &JsonValue) -> Result<Vec<ExtractedEvent>, FetchError> {
    if let Some(error) = body.get("error") {
        let message = error
            .get("message")
            .and_then(JsonValue::as_str)
            .unwrap_or("unknown error");
        return Err(FetchError::Extraction(message.to_string()));
    }
    let content = body
        .pointer("/choices/0/message/content")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| FetchError::Extraction("completion has no message content".into()))?;
    parse_event_list(content)
}

/// Accepts a bare JSON array, optionally wrapped in a fenced code block.
fn parse_event_list(content: &str) -> Result<Vec<ExtractedEvent>, FetchError> {
    let trimmed = content.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();
    serde_json::from_str(unfenced).map_err(|e| {
        warn!(error = %e, "extraction output is not an event list");
        FetchError::Extraction(format!("event list json: {e}"))
    })
}

/// Pre-extracted events from a JSON file; the message text is ignored.
#[derive(Debug, Clone)]
pub struct JsonFileExtractor {
    path: PathBuf,
}

impl JsonFileExtractor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl EventExtractor for JsonFileExtractor {
    async fn extract(&self, _message: &MailMessage) -> Result<Vec<ExtractedEvent>, FetchError> {
        let bytes = read_source_file(&self.path).await?;
        parse_event_list(&String::from_utf8_lossy(&bytes))
    }
}
