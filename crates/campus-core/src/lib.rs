//! Core event model, provenance and match contracts for campus event ingestion.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Location name used when a source gives no usable location.
pub const UNKNOWN_LOCATION: &str = "TBD";

/// Where an event record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Rss,
    Email,
    Calendar,
    Manual,
}

impl EventSource {
    /// Rank used when two sources disagree on a populated field.
    pub fn confidence(self) -> u8 {
        match self {
            EventSource::Manual => 3,
            EventSource::Rss => 2,
            EventSource::Calendar => 1,
            EventSource::Email => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventSource::Rss => "rss",
            EventSource::Email => "email",
            EventSource::Calendar => "calendar",
            EventSource::Manual => "manual",
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rss" => Ok(EventSource::Rss),
            "email" => Ok(EventSource::Email),
            "calendar" => Ok(EventSource::Calendar),
            "manual" => Ok(EventSource::Manual),
            other => Err(format!("unknown event source `{other}`")),
        }
    }
}

/// Stable identifier of a canonical event. Never reassigned by a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for EventId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Which configured source last wrote a value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Provenance {
    pub source: EventSource,
    pub source_id: String,
}

impl Provenance {
    pub fn new(source: EventSource, source_id: impl Into<String>) -> Self {
        Self {
            source,
            source_id: source_id.into(),
        }
    }

    pub fn manual() -> Self {
        Self::new(EventSource::Manual, "manual")
    }

    pub fn confidence(&self) -> u8 {
        self.source.confidence()
    }
}

/// Canonical field wrapper with optional value + provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field<T> {
    pub value: Option<T>,
    pub provenance: Option<Provenance>,
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Field<T> {
    pub fn empty() -> Self {
        Self {
            value: None,
            provenance: None,
        }
    }

    pub fn with_value(value: T, provenance: Provenance) -> Self {
        Self {
            value: Some(value),
            provenance: Some(provenance),
        }
    }

    /// Wraps an optional value, attaching provenance only when a value is present.
    pub fn from_option(value: Option<T>, provenance: &Provenance) -> Self {
        match value {
            Some(value) => Self::with_value(value, provenance.clone()),
            None => Self::empty(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_none()
    }

    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }
}

/// Normalized event location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Controlled-vocabulary name when one matched, otherwise the trimmed raw string.
    pub name: String,
    pub raw: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl Location {
    pub fn unknown() -> Self {
        Self {
            name: UNKNOWN_LOCATION.to_string(),
            raw: None,
            latitude: None,
            longitude: None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.name.trim().is_empty() || self.name.eq_ignore_ascii_case(UNKNOWN_LOCATION)
    }

    /// Case-folded name used for equality checks and the match key.
    pub fn key(&self) -> String {
        normalize_title_key(&self.name)
    }
}

impl Default for Location {
    fn default() -> Self {
        Self::unknown()
    }
}

/// Unvalidated, source-specific record as fetched. Every payload field is raw text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCandidate {
    pub source: EventSource,
    pub source_id: String,
    pub fetched_at: DateTime<Utc>,
    pub external_id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub published: Option<String>,
    pub location: Option<String>,
    pub link: Option<String>,
    pub picture_link: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Combined RSS author, e.g. `club@example.edu (Club Name)`.
    pub author: Option<String>,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
}

impl RawCandidate {
    pub fn new(source: EventSource, source_id: impl Into<String>, fetched_at: DateTime<Utc>) -> Self {
        Self {
            source,
            source_id: source_id.into(),
            fetched_at,
            external_id: None,
            title: None,
            description: None,
            start: None,
            end: None,
            published: None,
            location: None,
            link: None,
            picture_link: None,
            categories: Vec::new(),
            hosts: Vec::new(),
            author: None,
            author_name: None,
            author_email: None,
        }
    }
}

/// Normalized, not yet persisted event produced from a [`RawCandidate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDraft {
    pub source: EventSource,
    pub source_id: String,
    pub external_id: Option<String>,
    pub title: String,
    pub title_key: String,
    pub description: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub location: Location,
    pub external_link: Option<String>,
    pub picture_link: Option<String>,
    pub categories: BTreeSet<String>,
    pub hosts: BTreeSet<String>,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
}

impl EventDraft {
    pub fn provenance(&self) -> Provenance {
        Provenance::new(self.source, self.source_id.clone())
    }

    pub fn match_key(&self) -> MatchKey {
        MatchKey {
            title_key: self.title_key.clone(),
            start_time: self.start_time,
            location_key: self.location.key(),
        }
    }
}

/// Canonical persisted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub title: String,
    pub title_key: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub location: Location,
    /// Source that established title, times and location.
    pub primary: Provenance,
    /// Earliest-seen source; only changed by explicit promotion.
    pub source: EventSource,
    pub description: Field<String>,
    pub external_link: Field<String>,
    pub picture_link: Field<String>,
    pub author_name: Field<String>,
    pub author_email: Field<String>,
    pub categories: BTreeSet<String>,
    pub hosts: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Event {
    /// First sighting of a cluster: every populated draft field is attributed to the draft's source.
    pub fn from_draft(id: EventId, draft: &EventDraft, now: DateTime<Utc>) -> Self {
        let provenance = draft.provenance();
        Self {
            id,
            title: draft.title.clone(),
            title_key: draft.title_key.clone(),
            start_time: draft.start_time,
            end_time: draft.end_time,
            location: draft.location.clone(),
            primary: provenance.clone(),
            source: draft.source,
            description: Field::from_option(draft.description.clone(), &provenance),
            external_link: Field::from_option(draft.external_link.clone(), &provenance),
            picture_link: Field::from_option(draft.picture_link.clone(), &provenance),
            author_name: Field::from_option(draft.author_name.clone(), &provenance),
            author_email: Field::from_option(draft.author_email.clone(), &provenance),
            categories: draft.categories.clone(),
            hosts: draft.hosts.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn match_key(&self) -> MatchKey {
        MatchKey {
            title_key: self.title_key.clone(),
            start_time: self.start_time,
            location_key: self.location.key(),
        }
    }

    /// Applies an administrative edit. Edited values carry `Manual` provenance so no feed overwrites them.
    pub fn apply_curation(&mut self, patch: &CuratedPatch, now: DateTime<Utc>) -> Vec<String> {
        let manual = Provenance::manual();
        let mut changed = Vec::new();

        let mut identity_changed = false;
        if let Some(title) = &patch.title {
            if *title != self.title {
                self.title = title.clone();
                self.title_key = normalize_title_key(title);
                changed.push("title".to_string());
                identity_changed = true;
            }
        }
        if let Some(start) = patch.start_time {
            if start != self.start_time {
                self.start_time = start;
                changed.push("start_time".to_string());
                identity_changed = true;
            }
        }
        if let Some(end) = patch.end_time {
            if end != self.end_time {
                self.end_time = end;
                changed.push("end_time".to_string());
                identity_changed = true;
            }
        }
        if self.end_time < self.start_time {
            self.end_time = self.start_time;
        }
        if let Some(location) = &patch.location {
            if location.name != self.location.name {
                self.location = location.clone();
                changed.push("location".to_string());
                identity_changed = true;
            }
        }
        if identity_changed {
            self.primary = manual.clone();
        }

        for (name, field, value) in [
            ("description", &mut self.description, &patch.description),
            ("external_link", &mut self.external_link, &patch.external_link),
            ("picture_link", &mut self.picture_link, &patch.picture_link),
        ] {
            if let Some(value) = value {
                if field.value.as_ref() != Some(value) || field.provenance.as_ref() != Some(&manual) {
                    *field = Field::with_value(value.clone(), manual.clone());
                    changed.push(name.to_string());
                }
            }
        }

        if let Some(categories) = &patch.categories {
            if *categories != self.categories {
                self.categories = categories.clone();
                changed.push("categories".to_string());
            }
        }

        if !changed.is_empty() {
            self.updated_at = now;
        }
        changed
    }
}

/// Near-duplicate key: `(title, start_time, location)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatchKey {
    pub title_key: String,
    pub start_time: DateTime<Utc>,
    pub location_key: String,
}

/// Lower-cased alphanumeric words joined by single spaces.
pub fn normalize_title_key(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Inclusive time range a store scans for coarse match candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Draft window widened by `tolerance` on both sides.
    pub fn around(start: DateTime<Utc>, end: DateTime<Utc>, tolerance: Duration) -> Self {
        Self {
            start: start - tolerance,
            end: end + tolerance,
        }
    }

    /// True when `[start, end]` intersects this window.
    pub fn intersects(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        start <= self.end && end >= self.start
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchDecision {
    NoMatch,
    Single(EventId),
    Ambiguous {
        chosen: EventId,
        candidates: Vec<EventId>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeResult {
    pub event: Event,
    pub changed: Vec<String>,
}

/// Match + merge policy a store runs inside its atomic upsert section.
pub trait MatchResolver: Send + Sync {
    fn candidate_window(&self, draft: &EventDraft) -> TimeWindow;
    fn resolve(&self, draft: &EventDraft, existing: &[Event]) -> MatchDecision;
    fn merge(&self, stored: &Event, draft: &EventDraft, now: DateTime<Utc>) -> MergeResult;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpsertAction {
    Inserted,
    Merged { changed: Vec<String> },
    Unchanged,
}

/// Audit record for a draft that matched more than one stored event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmbiguousMatch {
    pub title: String,
    pub chosen: EventId,
    pub candidates: Vec<EventId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub id: EventId,
    pub action: UpsertAction,
    pub ambiguity: Option<AmbiguousMatch>,
}

/// Read-side filters; every clause is optional and clauses are AND-combined.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventQuery {
    pub text: Option<String>,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    pub starts_from: Option<DateTime<Utc>>,
    pub starts_until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl EventQuery {
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(text) = self.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            if !event.title.to_lowercase().contains(&text.to_lowercase()) {
                return false;
            }
        }
        if !self.locations.is_empty()
            && !self
                .locations
                .iter()
                .any(|l| l.trim().eq_ignore_ascii_case(event.location.name.trim()))
        {
            return false;
        }
        if !self.categories.is_empty()
            && !self.categories.iter().any(|wanted| {
                event
                    .categories
                    .iter()
                    .any(|have| have.eq_ignore_ascii_case(wanted.trim()))
            })
        {
            return false;
        }
        if let Some(from) = self.starts_from {
            if event.start_time < from {
                return false;
            }
        }
        if let Some(until) = self.starts_until {
            if event.start_time > until {
                return false;
            }
        }
        true
    }
}

/// Administrative edit applied with `Manual` provenance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CuratedPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub location: Option<Location>,
    pub external_link: Option<String>,
    pub picture_link: Option<String>,
    pub categories: Option<BTreeSet<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, 10, h, m, 0).single().unwrap()
    }

    fn draft(title: &str) -> EventDraft {
        EventDraft {
            source: EventSource::Rss,
            source_id: "hub".into(),
            external_id: None,
            title: title.into(),
            title_key: normalize_title_key(title),
            description: Some("Strings and brass".into()),
            start_time: at(22, 0),
            end_time: at(23, 0),
            location: Location {
                name: "Johnson Chapel".into(),
                raw: Some("Johnson Chapel".into()),
                latitude: None,
                longitude: None,
            },
            external_link: Some("https://hub.example.edu/event/1".into()),
            picture_link: None,
            categories: ["Music".to_string()].into_iter().collect(),
            hosts: BTreeSet::new(),
            author_name: None,
            author_email: None,
        }
    }

    #[test]
    fn title_key_folds_case_punctuation_and_whitespace() {
        assert_eq!(normalize_title_key("  Fall   Concert! "), "fall concert");
        assert_eq!(normalize_title_key("FALL-CONCERT"), "fall concert");
        assert_eq!(normalize_title_key("Café  Night"), "café night");
    }

    #[test]
    fn confidence_ranks_manual_over_feeds() {
        assert!(EventSource::Manual.confidence() > EventSource::Rss.confidence());
        assert!(EventSource::Rss.confidence() > EventSource::Calendar.confidence());
        assert!(EventSource::Calendar.confidence() > EventSource::Email.confidence());
        assert_eq!("Email".parse::<EventSource>(), Ok(EventSource::Email));
        assert!("imap".parse::<EventSource>().is_err());
    }

    #[test]
    fn from_draft_attributes_only_populated_fields() {
        let event = Event::from_draft(EventId::new(), &draft("Fall Concert"), at(12, 0));
        assert_eq!(event.description.provenance, Some(Provenance::new(EventSource::Rss, "hub")));
        assert!(event.picture_link.is_empty());
        assert!(event.picture_link.provenance.is_none());
        assert_eq!(event.source, EventSource::Rss);
        assert_eq!(event.match_key(), draft("Fall Concert").match_key());
    }

    #[test]
    fn query_filters_are_and_combined() {
        let event = Event::from_draft(EventId::new(), &draft("Fall Concert"), at(12, 0));
        let mut query = EventQuery {
            text: Some("concert".into()),
            locations: vec!["johnson chapel".into()],
            categories: vec!["music".into()],
            ..Default::default()
        };
        assert!(query.matches(&event));

        query.starts_from = Some(at(23, 30));
        assert!(!query.matches(&event));

        query.starts_from = None;
        query.categories = vec!["Athletics".into()];
        assert!(!query.matches(&event));
    }

    #[test]
    fn curation_marks_fields_manual_and_bumps_updated_at() {
        let mut event = Event::from_draft(EventId::new(), &draft("Fall Concert"), at(12, 0));
        let patch = CuratedPatch {
            description: Some("Orchestra and choir".into()),
            ..Default::default()
        };
        let changed = event.apply_curation(&patch, at(13, 0));
        assert_eq!(changed, vec!["description".to_string()]);
        assert_eq!(event.description.provenance, Some(Provenance::manual()));
        assert_eq!(event.updated_at, at(13, 0));

        let again = event.apply_curation(&patch, at(14, 0));
        assert!(again.is_empty());
        assert_eq!(event.updated_at, at(13, 0));
    }

    #[test]
    fn window_intersection_includes_edges() {
        let window = TimeWindow::around(at(18, 0), at(19, 0), Duration::minutes(30));
        assert!(window.intersects(at(19, 30), at(20, 0)));
        assert!(window.intersects(at(16, 0), at(17, 30)));
        assert!(!window.intersects(at(19, 31), at(20, 0)));
    }

    #[test]
    fn event_serializes_with_snake_case_source() {
        let event = Event::from_draft(EventId::new(), &draft("Fall Concert"), at(12, 0));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["source"], "rss");
        assert_eq!(json["primary"]["source_id"], "hub");
    }
}
