//! Near-duplicate matching and field-level merge policy.

use std::collections::HashSet;

use campus_core::{
    normalize_title_key, Event, EventDraft, EventId, EventSource, Field, Location,
    MatchDecision, MatchResolver, MergeResult, Provenance, TimeWindow,
};
use chrono::{DateTime, Duration, Utc};
use strsim::jaro_winkler;

#[derive(Debug, Clone, Copy)]
pub struct DedupConfig {
    pub time_tolerance: Duration,
    /// 1.0 means exact normalized titles only.
    pub title_similarity_threshold: f64,
    pub unknown_location_matches_any: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            time_tolerance: Duration::minutes(30),
            title_similarity_threshold: 1.0,
            unknown_location_matches_any: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Deduplicator {
    config: DedupConfig,
}

impl Deduplicator {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    /// Resolver for one source's batch. Events in `written` were already stored by
    /// this batch and are not refreshed again by the same feed.
    pub fn for_batch<'a>(&'a self, written: &'a HashSet<EventId>) -> BatchResolver<'a> {
        BatchResolver {
            dedup: self,
            written,
        }
    }

    fn times_match(&self, draft: &EventDraft, event: &Event) -> bool {
        let tolerance = self.config.time_tolerance;
        if (event.start_time - draft.start_time).abs() <= tolerance {
            return true;
        }
        let overlaps = event.start_time <= draft.end_time && draft.start_time <= event.end_time;
        overlaps && (event.end_time - draft.end_time).abs() <= tolerance
    }

    fn titles_match(&self, draft: &EventDraft, event: &Event) -> bool {
        if draft.title_key == event.title_key {
            return true;
        }
        self.config.title_similarity_threshold < 1.0
            && jaro_winkler(&draft.title_key, &event.title_key) >= self.config.title_similarity_threshold
    }

    fn locations_compatible(&self, draft: &Location, stored: &Location) -> bool {
        if draft.key() == stored.key() {
            return true;
        }
        if draft.is_unknown() || stored.is_unknown() {
            return self.config.unknown_location_matches_any;
        }
        let keys = |location: &Location| {
            let mut keys = vec![location.key()];
            if let Some(raw) = &location.raw {
                keys.push(normalize_title_key(raw));
            }
            keys.retain(|k| !k.is_empty());
            keys
        };
        let (ours, theirs) = (keys(draft), keys(stored));
        ours.iter()
            .any(|a| theirs.iter().any(|b| a.contains(b.as_str()) || b.contains(a.as_str())))
    }

    pub fn is_match(&self, draft: &EventDraft, event: &Event) -> bool {
        self.times_match(draft, event)
            && self.titles_match(draft, event)
            && self.locations_compatible(&draft.location, &event.location)
    }
}

impl MatchResolver for Deduplicator {
    fn candidate_window(&self, draft: &EventDraft) -> TimeWindow {
        TimeWindow::around(draft.start_time, draft.end_time, self.config.time_tolerance)
    }

    fn resolve(&self, draft: &EventDraft, existing: &[Event]) -> MatchDecision {
        let mut hits = existing
            .iter()
            .filter(|event| self.is_match(draft, event))
            .map(|event| (jaro_winkler(&draft.title_key, &event.title_key), event.start_time, event.id))
            .collect::<Vec<(f64, DateTime<Utc>, EventId)>>();
        hits.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then_with(|| a.1.cmp(&b.1))
                .then_with(|| a.2.cmp(&b.2))
        });
        match hits.as_slice() {
            [] => MatchDecision::NoMatch,
            [(_, _, id)] => MatchDecision::Single(*id),
            [(_, _, chosen), ..] => MatchDecision::Ambiguous {
                chosen: *chosen,
                candidates: hits.iter().map(|(_, _, id)| *id).collect(),
            },
        }
    }

    fn merge(&self, stored: &Event, draft: &EventDraft, now: DateTime<Utc>) -> MergeResult {
        merge_draft(stored, draft, now, true)
    }
}

/// Wraps a [`Deduplicator`] for the drafts of one source within one cycle.
///
/// Two near-duplicate items in one feed (say a session listed at 18:00 and 18:20)
/// resolve to the same event. Only the first may refresh values the feed owns; the
/// rest can fill gaps, so a rerun of the same input leaves the event unchanged.
pub struct BatchResolver<'a> {
    dedup: &'a Deduplicator,
    written: &'a HashSet<EventId>,
}

impl MatchResolver for BatchResolver<'_> {
    fn candidate_window(&self, draft: &EventDraft) -> TimeWindow {
        self.dedup.candidate_window(draft)
    }

    fn resolve(&self, draft: &EventDraft, existing: &[Event]) -> MatchDecision {
        self.dedup.resolve(draft, existing)
    }

    fn merge(&self, stored: &Event, draft: &EventDraft, now: DateTime<Utc>) -> MergeResult {
        merge_draft(stored, draft, now, !self.written.contains(&stored.id))
    }
}

/// `refresh` lets a draft replace values already owned by its own provenance.
fn merge_draft(stored: &Event, draft: &EventDraft, now: DateTime<Utc>, refresh: bool) -> MergeResult {
    let incoming = draft.provenance();
    let mut event = stored.clone();
    let mut changed = Vec::new();

    merge_identity(&mut event, draft, &incoming, refresh, &mut changed);

    for (name, field, value) in [
        ("description", &mut event.description, &draft.description),
        ("external_link", &mut event.external_link, &draft.external_link),
        ("picture_link", &mut event.picture_link, &draft.picture_link),
        ("author_name", &mut event.author_name, &draft.author_name),
        ("author_email", &mut event.author_email, &draft.author_email),
    ] {
        if merge_field(field, value.as_ref(), &incoming, refresh) {
            changed.push(name.to_string());
        }
    }

    let categories = event.categories.len();
    event.categories.extend(draft.categories.iter().cloned());
    if event.categories.len() != categories {
        changed.push("categories".to_string());
    }
    let hosts = event.hosts.len();
    event.hosts.extend(draft.hosts.iter().cloned());
    if event.hosts.len() != hosts {
        changed.push("hosts".to_string());
    }

    if !changed.is_empty() {
        event.updated_at = now;
    }
    MergeResult { event, changed }
}

/// True when `incoming` may replace a populated value owned by `current`.
fn may_overwrite(current: Option<&Provenance>, incoming: &Provenance, refresh: bool) -> bool {
    match current {
        None => true,
        Some(current) if current.source == EventSource::Manual => false,
        Some(current) => {
            (refresh && current == incoming) || incoming.confidence() > current.confidence()
        }
    }
}

fn merge_field(
    field: &mut Field<String>,
    value: Option<&String>,
    incoming: &Provenance,
    refresh: bool,
) -> bool {
    let Some(value) = value else {
        return false;
    };
    if field.value.as_ref() == Some(value) {
        return false;
    }
    if field.is_empty() || may_overwrite(field.provenance.as_ref(), incoming, refresh) {
        *field = Field::with_value(value.clone(), incoming.clone());
        return true;
    }
    false
}

/// Title, times and location move together under the `primary` provenance. An unknown
/// stored location is filled by any source.
fn merge_identity(
    event: &mut Event,
    draft: &EventDraft,
    incoming: &Provenance,
    refresh: bool,
    changed: &mut Vec<String>,
) {
    let before = changed.len();
    if may_overwrite(Some(&event.primary), incoming, refresh) {
        if event.title != draft.title {
            event.title = draft.title.clone();
            event.title_key = draft.title_key.clone();
            changed.push("title".to_string());
        }
        if event.start_time != draft.start_time {
            event.start_time = draft.start_time;
            changed.push("start_time".to_string());
        }
        if event.end_time != draft.end_time {
            event.end_time = draft.end_time;
            changed.push("end_time".to_string());
        }
        if !draft.location.is_unknown() && event.location != draft.location {
            event.location = draft.location.clone();
            changed.push("location".to_string());
        }
        if changed.len() != before {
            event.primary = incoming.clone();
        }
    } else if event.location.is_unknown() && !draft.location.is_unknown() {
        event.location = draft.location.clone();
        changed.push("location".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeSet;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, 18, hour, minute, 0).single().unwrap()
    }

    fn location(name: &str) -> Location {
        Location {
            name: name.to_string(),
            raw: Some(name.to_string()),
            latitude: None,
            longitude: None,
        }
    }

    fn draft(source: EventSource, source_id: &str, title: &str, start: DateTime<Utc>) -> EventDraft {
        EventDraft {
            source,
            source_id: source_id.to_string(),
            external_id: None,
            title: title.to_string(),
            title_key: normalize_title_key(title),
            description: None,
            start_time: start,
            end_time: start + Duration::minutes(90),
            location: location("Buckley Recital Hall"),
            external_link: None,
            picture_link: None,
            categories: BTreeSet::new(),
            hosts: BTreeSet::new(),
            author_name: None,
            author_email: None,
        }
    }

    fn stored(draft: &EventDraft) -> Event {
        Event::from_draft(EventId::new(), draft, at(3, 0))
    }

    #[test]
    fn rss_and_email_five_minutes_apart_match() {
        let dedup = Deduplicator::default();
        let rss = stored(&draft(EventSource::Rss, "hub-rss", "Fall Concert", at(22, 0)));
        let email = draft(EventSource::Email, "daily-mammoth", "Fall  concert!", at(22, 5));
        assert_eq!(dedup.resolve(&email, &[rss.clone()]), MatchDecision::Single(rss.id));
    }

    #[test]
    fn distant_times_or_other_titles_do_not_match() {
        let dedup = Deduplicator::default();
        let rss = stored(&draft(EventSource::Rss, "hub-rss", "Fall Concert", at(22, 0)));

        let next_slot = draft(EventSource::Rss, "hub-rss", "Fall Concert", at(20, 0));
        assert_eq!(dedup.resolve(&next_slot, &[rss.clone()]), MatchDecision::NoMatch);

        let other = draft(EventSource::Rss, "hub-rss", "Fall Concert Rehearsal", at(22, 0));
        assert_eq!(dedup.resolve(&other, &[rss]), MatchDecision::NoMatch);
    }

    #[test]
    fn fuzzy_titles_match_only_below_exact_threshold() {
        let rss = stored(&draft(EventSource::Rss, "hub-rss", "Fall Concert", at(22, 0)));
        let typo = draft(EventSource::Email, "daily-mammoth", "Fall Concrt", at(22, 0));

        assert_eq!(Deduplicator::default().resolve(&typo, &[rss.clone()]), MatchDecision::NoMatch);

        let fuzzy = Deduplicator::new(DedupConfig {
            title_similarity_threshold: 0.9,
            ..DedupConfig::default()
        });
        assert_eq!(fuzzy.resolve(&typo, &[rss.clone()]), MatchDecision::Single(rss.id));
    }

    #[test]
    fn location_compatibility() {
        let dedup = Deduplicator::default();
        let mut rss_draft = draft(EventSource::Rss, "hub-rss", "Fall Concert", at(22, 0));
        rss_draft.location = location("Buckley Recital Hall (Arms Music Center)");
        let rss = stored(&rss_draft);

        let contained = draft(EventSource::Calendar, "college-calendar", "Fall Concert", at(22, 0));
        assert!(dedup.is_match(&contained, &rss));

        let mut unknown = contained.clone();
        unknown.location = Location::unknown();
        assert!(dedup.is_match(&unknown, &rss));
        let strict = Deduplicator::new(DedupConfig {
            unknown_location_matches_any: false,
            ..DedupConfig::default()
        });
        assert!(!strict.is_match(&unknown, &rss));

        let mut elsewhere = contained;
        elsewhere.location = location("Frost Library");
        assert!(!dedup.is_match(&elsewhere, &rss));
    }

    #[test]
    fn ambiguous_tie_break_is_deterministic() {
        let dedup = Deduplicator::default();
        let base = draft(EventSource::Rss, "hub-rss", "Fall Concert", at(22, 0));
        let mut early = stored(&draft(EventSource::Rss, "hub-rss", "Fall Concert", at(21, 50)));
        let mut late = stored(&draft(EventSource::Rss, "hub-rss", "Fall Concert", at(22, 10)));
        early.id = EventId(uuid::Uuid::from_u128(2));
        late.id = EventId(uuid::Uuid::from_u128(1));

        let forward = dedup.resolve(&base, &[late.clone(), early.clone()]);
        let backward = dedup.resolve(&base, &[early.clone(), late.clone()]);
        assert_eq!(forward, backward);
        assert_eq!(
            forward,
            MatchDecision::Ambiguous {
                chosen: early.id,
                candidates: vec![early.id, late.id],
            }
        );

        let mut twin = early.clone();
        twin.id = EventId(uuid::Uuid::from_u128(0));
        match dedup.resolve(&base, &[early, twin.clone()]) {
            MatchDecision::Ambiguous { chosen, .. } => assert_eq!(chosen, twin.id),
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }

    #[test]
    fn merge_fills_empty_fields_and_unions_sets() {
        let dedup = Deduplicator::default();
        let mut rss_draft = draft(EventSource::Rss, "hub-rss", "Fall Concert", at(22, 0));
        rss_draft.categories.insert("Music".into());
        let rss = stored(&rss_draft);

        let mut calendar = draft(EventSource::Calendar, "college-calendar", "Fall Concert", at(22, 0));
        calendar.picture_link = Some("https://www.amherst.edu/concert.jpg".into());
        calendar.categories.insert("Arts".into());

        let merged = dedup.merge(&rss, &calendar, at(4, 0));
        assert_eq!(merged.changed, vec!["picture_link".to_string(), "categories".to_string()]);
        assert_eq!(merged.event.id, rss.id);
        assert_eq!(merged.event.source, EventSource::Rss);
        assert_eq!(
            merged.event.picture_link.provenance.as_ref().map(|p| p.source),
            Some(EventSource::Calendar)
        );
        assert_eq!(merged.event.categories.len(), 2);
        assert_eq!(merged.event.updated_at, at(4, 0));
    }

    #[test]
    fn lower_confidence_never_overwrites_and_merge_is_idempotent() {
        let dedup = Deduplicator::default();
        let mut rss_draft = draft(EventSource::Rss, "hub-rss", "Fall Concert", at(22, 0));
        rss_draft.description = Some("Orchestra and choir".into());
        let rss = stored(&rss_draft);

        let mut email = draft(EventSource::Email, "daily-mammoth", "Fall Concert", at(22, 5));
        email.description = Some("Concert tonight".into());
        let merged = dedup.merge(&rss, &email, at(4, 0));
        assert!(merged.changed.is_empty());
        assert_eq!(merged.event, rss);

        let again = dedup.merge(&rss, &rss_draft, at(5, 0));
        assert!(again.changed.is_empty());
        assert_eq!(again.event.updated_at, rss.updated_at);
    }

    #[test]
    fn higher_confidence_takes_over_timing_once() {
        let dedup = Deduplicator::default();
        let email = stored(&draft(EventSource::Email, "daily-mammoth", "Fall Concert", at(22, 5)));
        let rss = draft(EventSource::Rss, "hub-rss", "Fall Concert", at(22, 0));

        let merged = dedup.merge(&email, &rss, at(4, 0));
        assert_eq!(merged.event.start_time, at(22, 0));
        assert_eq!(merged.event.primary.source, EventSource::Rss);
        assert!(merged.changed.contains(&"start_time".to_string()));

        let email_again = draft(EventSource::Email, "daily-mammoth", "Fall Concert", at(22, 5));
        let settled = dedup.merge(&merged.event, &email_again, at(5, 0));
        assert!(settled.changed.is_empty());
        assert_eq!(settled.event.start_time, at(22, 0));
    }

    #[test]
    fn same_source_refresh_replaces_its_own_values() {
        let dedup = Deduplicator::default();
        let mut first = draft(EventSource::Calendar, "college-calendar", "Fall Concert", at(22, 0));
        first.description = Some("Old text".into());
        let calendar = stored(&first);

        let mut refreshed = first.clone();
        refreshed.description = Some("New text".into());
        refreshed.start_time = at(22, 15);
        refreshed.end_time = at(23, 45);
        let merged = dedup.merge(&calendar, &refreshed, at(4, 0));
        assert_eq!(merged.event.description.get().map(String::as_str), Some("New text"));
        assert_eq!(merged.event.start_time, at(22, 15));
    }

    #[test]
    fn batch_keeps_the_first_session_a_feed_wrote() {
        let dedup = Deduplicator::default();
        let early = draft(EventSource::Rss, "hub-rss", "Office Hours", at(18, 0));
        let event = stored(&early);
        let mut late = draft(EventSource::Rss, "hub-rss", "Office Hours", at(18, 20));
        late.picture_link = Some("https://www.amherst.edu/office-hours.png".into());

        let written = HashSet::from([event.id]);
        let batch = dedup.for_batch(&written);
        let merged = batch.merge(&event, &late, at(4, 0));
        assert_eq!(merged.changed, vec!["picture_link".to_string()]);
        assert_eq!(merged.event.start_time, at(18, 0));

        let fresh = HashSet::new();
        let next_cycle = dedup.for_batch(&fresh).merge(&merged.event, &early, at(5, 0));
        assert!(next_cycle.changed.is_empty());
        assert_eq!(next_cycle.event.updated_at, at(4, 0));
    }

    #[test]
    fn manual_values_survive_every_feed() {
        let dedup = Deduplicator::default();
        let mut event = stored(&draft(EventSource::Email, "daily-mammoth", "Fall Concert", at(22, 0)));
        event.description = Field::with_value("Curated".to_string(), Provenance::manual());
        event.primary = Provenance::manual();

        let mut rss = draft(EventSource::Rss, "hub-rss", "Fall Concert", at(22, 10));
        rss.description = Some("Feed text".into());
        let merged = dedup.merge(&event, &rss, at(4, 0));
        assert_eq!(merged.event.description.get().map(String::as_str), Some("Curated"));
        assert_eq!(merged.event.start_time, at(22, 0));
    }

    #[test]
    fn unknown_location_is_filled_by_any_source() {
        let dedup = Deduplicator::default();
        let mut rss_draft = draft(EventSource::Rss, "hub-rss", "Fall Concert", at(22, 0));
        rss_draft.location = Location::unknown();
        let rss = stored(&rss_draft);

        let email = draft(EventSource::Email, "daily-mammoth", "Fall Concert", at(22, 0));
        let merged = dedup.merge(&rss, &email, at(4, 0));
        assert_eq!(merged.changed, vec!["location".to_string()]);
        assert_eq!(merged.event.location.name, "Buckley Recital Hall");
        assert_eq!(merged.event.primary.source, EventSource::Rss);
    }
}
