//! Raw candidate to validated draft: times, locations and free text.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use campus_core::{normalize_title_key, EventDraft, Location, RawCandidate, UNKNOWN_LOCATION};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;
use scraper::Html;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizationError {
    #[error("candidate has no title")]
    MissingTitle,
    #[error("candidate `{0}` has no start time")]
    MissingStart(String),
    #[error("candidate `{0}` is cancelled")]
    Cancelled(String),
    #[error("unparseable {field} `{value}`")]
    UnparseableTime { field: &'static str, value: String },
    #[error("end {end} precedes start {start}")]
    EndBeforeStart {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationBucket {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub keywords: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct LocationRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    buckets: Vec<LocationBucket>,
}

/// Keyword buckets mapping free-text locations to canonical campus buildings.
/// The first bucket with a whole-word, case-insensitive keyword hit wins.
#[derive(Debug, Clone)]
pub struct LocationVocabulary {
    buckets: Vec<(LocationBucket, Regex)>,
}

impl LocationVocabulary {
    pub fn new(buckets: Vec<LocationBucket>) -> Result<Self> {
        let compiled = buckets
            .into_iter()
            .filter(|bucket| !bucket.keywords.is_empty())
            .map(|bucket| {
                let alternatives = bucket
                    .keywords
                    .iter()
                    .map(|k| regex::escape(k.trim()))
                    .collect::<Vec<_>>()
                    .join("|");
                let pattern = format!(r"(?i)\b(?:{alternatives})\b");
                let regex = Regex::new(&pattern)
                    .with_context(|| format!("compiling keywords for {}", bucket.name))?;
                Ok((bucket, regex))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { buckets: compiled })
    }

    pub fn builtin() -> Result<Self> {
        let bucket = |name: &str, latitude: f64, longitude: f64, keywords: &[&str]| LocationBucket {
            name: name.to_string(),
            latitude,
            longitude,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        };
        let buckets = vec![
            bucket(
                "Keefe Campus Center",
                42.37141504481807,
                -72.51479991450528,
                &["Keefe", "Queer", "Multicultural", "Friedmann"],
            ),
            bucket("Ford Hall", 42.36923506234738, -72.51529130962976, &["Ford"]),
            bucket(
                "Science Center",
                42.37105378715133,
                -72.51334790776447,
                &["SCCE", "Science Center"],
            ),
            bucket("Chapin Hall", 42.371771820543486, -72.51572746604714, &["Chapin"]),
            bucket(
                "Alumni Gymnasium",
                42.368819594097864,
                -72.5188658145099,
                &["Gym", "Cage", "Lefrak", "Middleton Gym"],
            ),
            bucket("Frost Library", 42.37183195277655, -72.51699336789369, &["Frost"]),
            bucket(
                "Beneski Museum of Natural History",
                42.37209277500926,
                -72.51422459549485,
                &["Paino"],
            ),
            bucket("Powerhouse", 42.372109655195466, -72.51309270030836, &["Powerhouse"]),
            bucket(
                "Converse Hall",
                42.37243680844771,
                -72.518433147017,
                &["Converse", "Assembly Room", "Red Room"],
            ),
        ];
        Self::new(buckets)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let rules: LocationRulesFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Self::new(rules.buckets)
    }

    /// `rules/locations.yaml` when present, otherwise the built-in table.
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("rules").join("locations.yaml");
        if path.exists() {
            Self::from_file(&path)
        } else {
            Self::builtin()
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn resolve(&self, raw: Option<&str>) -> Location {
        let Some(raw) = raw.map(collapse_whitespace).filter(|r| !r.is_empty()) else {
            return Location::unknown();
        };
        if raw.eq_ignore_ascii_case(UNKNOWN_LOCATION) {
            return Location::unknown();
        }
        for (bucket, regex) in &self.buckets {
            if regex.is_match(&raw) {
                return Location {
                    name: bucket.name.clone(),
                    raw: Some(raw),
                    latitude: Some(bucket.latitude),
                    longitude: Some(bucket.longitude),
                };
            }
        }
        Location {
            name: raw.clone(),
            raw: Some(raw),
            latitude: None,
            longitude: None,
        }
    }
}

/// Parsed time value; `time_only` marks values that borrowed the reference date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ParsedInstant {
    at: DateTime<Utc>,
    time_only: bool,
}

const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

const TIME_FORMATS: &[&str] = &["%H:%M:%S", "%H:%M", "%I:%M %p", "%I:%M%p"];

#[derive(Debug, Clone)]
pub struct Normalizer {
    timezone: Tz,
    default_duration: Duration,
    vocabulary: LocationVocabulary,
    cancelled: Regex,
}

impl Normalizer {
    pub fn new(timezone: Tz, vocabulary: LocationVocabulary) -> Result<Self> {
        Ok(Self {
            timezone,
            default_duration: Duration::hours(1),
            vocabulary,
            cancelled: Regex::new(r"(?i)\bcancell?ed\b").context("compiling cancelled pattern")?,
        })
    }

    pub fn with_default_duration(mut self, duration: Duration) -> Self {
        self.default_duration = duration;
        self
    }

    pub fn normalize(&self, raw: &RawCandidate) -> Result<EventDraft, NormalizationError> {
        let title = raw
            .title
            .as_deref()
            .map(strip_html)
            .filter(|t| !t.is_empty())
            .ok_or(NormalizationError::MissingTitle)?;
        if self.cancelled.is_match(&title) {
            return Err(NormalizationError::Cancelled(title));
        }

        let reference = self.reference_date(raw);
        let start_raw = raw
            .start
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| NormalizationError::MissingStart(title.clone()))?;
        let start = self
            .parse_instant(start_raw, reference)
            .ok_or_else(|| NormalizationError::UnparseableTime {
                field: "start",
                value: start_raw.to_string(),
            })?;

        let end = match raw.end.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(end_raw) => {
                let end = self.parse_instant(end_raw, reference).ok_or_else(|| {
                    NormalizationError::UnparseableTime {
                        field: "end",
                        value: end_raw.to_string(),
                    }
                })?;
                if end.at >= start.at {
                    end.at
                } else if end.time_only && end.at + Duration::days(1) >= start.at {
                    end.at + Duration::days(1)
                } else {
                    return Err(NormalizationError::EndBeforeStart {
                        start: start.at,
                        end: end.at,
                    });
                }
            }
            None => start.at + self.default_duration,
        };

        let (author_name, author_email) = split_author(raw);
        let draft = EventDraft {
            source: raw.source,
            source_id: raw.source_id.clone(),
            external_id: raw.external_id.clone(),
            title_key: normalize_title_key(&title),
            title,
            description: raw
                .description
                .as_deref()
                .map(strip_html)
                .filter(|d| !d.is_empty()),
            start_time: start.at,
            end_time: end,
            location: self.vocabulary.resolve(raw.location.as_deref()),
            external_link: clean_url(raw.link.as_deref()),
            picture_link: clean_url(raw.picture_link.as_deref()),
            categories: clean_labels(&raw.categories),
            hosts: clean_labels(&raw.hosts),
            author_name,
            author_email,
        };
        debug!(source_id = %draft.source_id, title = %draft.title, start = %draft.start_time, "normalized");
        Ok(draft)
    }

    /// Date that time-only values are anchored to: the published date, else the fetch date.
    fn reference_date(&self, raw: &RawCandidate) -> NaiveDate {
        let fallback = raw.fetched_at.with_timezone(&self.timezone).date_naive();
        raw.published
            .as_deref()
            .and_then(|p| self.parse_instant(p.trim(), fallback))
            .filter(|p| !p.time_only)
            .map(|p| p.at.with_timezone(&self.timezone).date_naive())
            .unwrap_or(fallback)
    }

    fn parse_instant(&self, value: &str, reference: NaiveDate) -> Option<ParsedInstant> {
        let value = value.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
            return Some(ParsedInstant {
                at: dt.with_timezone(&Utc),
                time_only: false,
            });
        }
        if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
            return Some(ParsedInstant {
                at: dt.with_timezone(&Utc),
                time_only: false,
            });
        }
        for format in NAIVE_DATETIME_FORMATS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
                return Some(ParsedInstant {
                    at: self.localize(naive)?,
                    time_only: false,
                });
            }
        }
        if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
            return Some(ParsedInstant {
                at: self.localize(date.and_time(NaiveTime::MIN))?,
                time_only: false,
            });
        }
        let upper = value.to_ascii_uppercase();
        for format in TIME_FORMATS {
            if let Ok(time) = NaiveTime::parse_from_str(&upper, format) {
                return Some(ParsedInstant {
                    at: self.localize(reference.and_time(time))?,
                    time_only: true,
                });
            }
        }
        None
    }

    /// Campus wall-clock time to UTC. Ambiguous times take the earlier instant; times
    /// inside a DST gap move forward one hour.
    fn localize(&self, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
        self.timezone
            .from_local_datetime(&naive)
            .earliest()
            .or_else(|| {
                self.timezone
                    .from_local_datetime(&(naive + Duration::hours(1)))
                    .earliest()
            })
            .map(|dt| dt.with_timezone(&Utc))
    }
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Markup removed, entities decoded, whitespace collapsed.
pub fn strip_html(input: &str) -> String {
    if !input.contains('<') && !input.contains('&') {
        return collapse_whitespace(input);
    }
    let fragment = Html::parse_fragment(input);
    let text = fragment.root_element().text().collect::<Vec<_>>().join(" ");
    collapse_whitespace(&text)
}

fn clean_labels(values: &[String]) -> BTreeSet<String> {
    values
        .iter()
        .map(|v| collapse_whitespace(strip_html(v).trim_matches(|c: char| !c.is_alphanumeric())))
        .filter(|v| !v.is_empty())
        .collect()
}

fn clean_url(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

/// Explicit name/email fields win; otherwise split an RSS `email (Name)` author.
fn split_author(raw: &RawCandidate) -> (Option<String>, Option<String>) {
    let name = raw.author_name.as_deref().map(collapse_whitespace).filter(|s| !s.is_empty());
    let email = raw.author_email.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(String::from);
    if name.is_some() || email.is_some() {
        return (name, email);
    }
    let Some(author) = raw.author.as_deref().map(str::trim).filter(|s| !s.is_empty()) else {
        return (None, None);
    };
    match author.split_once(" (") {
        Some((email, rest)) => {
            let name = rest.trim_end().trim_end_matches(')').trim();
            (
                Some(name.to_string()).filter(|n| !n.is_empty()),
                Some(email.trim().to_string()).filter(|e| !e.is_empty()),
            )
        }
        None if author.contains('@') => (None, Some(author.to_string())),
        None => (Some(author.to_string()), None),
    }
}
