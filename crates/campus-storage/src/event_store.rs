use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use campus_core::{
    AmbiguousMatch, CuratedPatch, Event, EventDraft, EventId, EventQuery, EventSource,
    MatchDecision, MatchKey, MatchResolver, UpsertAction, UpsertOutcome,
};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("event store unavailable: {0}")]
    Unavailable(String),
    #[error("constraint violated: {0}")]
    Constraint(String),
    #[error("event {0} not found")]
    NotFound(EventId),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("event payload encoding failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Only connectivity loss aborts a cycle; every other error drops one candidate.
    pub fn is_unavailable(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Database(err) => matches!(
                err,
                sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
            ),
            _ => false,
        }
    }
}

/// Persistent home of canonical events.
///
/// `upsert` is the only write path the ingestion cycle uses. Implementations run
/// the whole read-decide-write sequence atomically so concurrent writers never
/// create two events for one cluster.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    async fn upsert(
        &self,
        draft: &EventDraft,
        key: &MatchKey,
        resolver: &dyn MatchResolver,
    ) -> Result<UpsertOutcome, StoreError>;

    /// Matching events ordered by `start_time`, ties by id.
    async fn query(&self, query: &EventQuery) -> Result<Vec<Event>, StoreError>;

    async fn get(&self, id: EventId) -> Result<Option<Event>, StoreError>;

    /// Reassigns the earliest-seen source tag. Field provenance is untouched.
    async fn promote(&self, id: EventId, source: EventSource) -> Result<Event, StoreError>;

    async fn curate(&self, id: EventId, patch: &CuratedPatch) -> Result<Event, StoreError>;

    /// Removes events that started before `cutoff` and returns them.
    async fn delete_started_before(&self, cutoff: DateTime<Utc>)
        -> Result<Vec<Event>, StoreError>;

    async fn distinct_locations(&self) -> Result<Vec<String>, StoreError>;

    async fn distinct_categories(&self) -> Result<Vec<String>, StoreError>;
}

pub(crate) fn validate_draft(draft: &EventDraft) -> Result<(), StoreError> {
    if draft.title.trim().is_empty() {
        return Err(StoreError::Constraint("event title is empty".into()));
    }
    if draft.end_time < draft.start_time {
        return Err(StoreError::Constraint(format!(
            "end_time {} precedes start_time {}",
            draft.end_time, draft.start_time
        )));
    }
    Ok(())
}

/// Write a store must perform to finish an upsert.
#[derive(Debug)]
pub(crate) enum UpsertPlan {
    Insert(Event),
    Update {
        event: Event,
        changed: Vec<String>,
        ambiguity: Option<AmbiguousMatch>,
    },
    Keep {
        id: EventId,
        ambiguity: Option<AmbiguousMatch>,
    },
}

impl UpsertPlan {
    pub(crate) fn outcome(&self) -> UpsertOutcome {
        match self {
            UpsertPlan::Insert(event) => UpsertOutcome {
                id: event.id,
                action: UpsertAction::Inserted,
                ambiguity: None,
            },
            UpsertPlan::Update {
                event,
                changed,
                ambiguity,
            } => UpsertOutcome {
                id: event.id,
                action: UpsertAction::Merged {
                    changed: changed.clone(),
                },
                ambiguity: ambiguity.clone(),
            },
            UpsertPlan::Keep { id, ambiguity } => UpsertOutcome {
                id: *id,
                action: UpsertAction::Unchanged,
                ambiguity: ambiguity.clone(),
            },
        }
    }
}

/// Decides insert vs merge given the candidates a store loaded for the resolver window.
pub(crate) fn plan_upsert(
    draft: &EventDraft,
    candidates: &[Event],
    resolver: &dyn MatchResolver,
    now: DateTime<Utc>,
) -> Result<UpsertPlan, StoreError> {
    let (target, ambiguity) = match resolver.resolve(draft, candidates) {
        MatchDecision::NoMatch => {
            return Ok(UpsertPlan::Insert(Event::from_draft(EventId::new(), draft, now)));
        }
        MatchDecision::Single(id) => (id, None),
        MatchDecision::Ambiguous { chosen, candidates } => (
            chosen,
            Some(AmbiguousMatch {
                title: draft.title.clone(),
                chosen,
                candidates,
            }),
        ),
    };

    let stored = candidates
        .iter()
        .find(|event| event.id == target)
        .ok_or_else(|| {
            StoreError::Constraint(format!("resolver chose {target} outside the candidate set"))
        })?;

    let merged = resolver.merge(stored, draft, now);
    if merged.changed.is_empty() {
        return Ok(UpsertPlan::Keep {
            id: stored.id,
            ambiguity,
        });
    }
    if merged.event.id != stored.id || merged.event.end_time < merged.event.start_time {
        return Err(StoreError::Constraint(format!(
            "merge into {} produced an invalid event",
            stored.id
        )));
    }
    Ok(UpsertPlan::Update {
        event: merged.event,
        changed: merged.changed,
        ambiguity,
    })
}

/// In-process store. One async mutex guards each read-decide-write sequence.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    events: Mutex<BTreeMap<EventId, Event>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.lock().await.is_empty()
    }

    pub async fn all(&self) -> Vec<Event> {
        let mut events = self.events.lock().await.values().cloned().collect::<Vec<_>>();
        sort_events(&mut events);
        events
    }
}

pub(crate) fn sort_events(events: &mut [Event]) {
    events.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.id.cmp(&b.id)));
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn upsert(
        &self,
        draft: &EventDraft,
        key: &MatchKey,
        resolver: &dyn MatchResolver,
    ) -> Result<UpsertOutcome, StoreError> {
        validate_draft(draft)?;
        let mut events = self.events.lock().await;

        let window = resolver.candidate_window(draft);
        let mut candidates = events
            .values()
            .filter(|event| window.intersects(event.start_time, event.end_time))
            .cloned()
            .collect::<Vec<_>>();
        sort_events(&mut candidates);

        let plan = plan_upsert(draft, &candidates, resolver, Utc::now())?;
        let outcome = plan.outcome();
        match plan {
            UpsertPlan::Insert(event) | UpsertPlan::Update { event, .. } => {
                events.insert(event.id, event);
            }
            UpsertPlan::Keep { .. } => {}
        }
        debug!(title_key = %key.title_key, id = %outcome.id, action = ?outcome.action, "upsert");
        Ok(outcome)
    }

    async fn query(&self, query: &EventQuery) -> Result<Vec<Event>, StoreError> {
        let events = self.events.lock().await;
        let mut hits = events
            .values()
            .filter(|event| query.matches(event))
            .cloned()
            .collect::<Vec<_>>();
        sort_events(&mut hits);
        if let Some(limit) = query.limit {
            hits.truncate(limit);
        }
        Ok(hits)
    }

    async fn get(&self, id: EventId) -> Result<Option<Event>, StoreError> {
        Ok(self.events.lock().await.get(&id).cloned())
    }

    async fn promote(&self, id: EventId, source: EventSource) -> Result<Event, StoreError> {
        let mut events = self.events.lock().await;
        let event = events.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if event.source != source {
            event.source = source;
            event.updated_at = Utc::now();
        }
        Ok(event.clone())
    }

    async fn curate(&self, id: EventId, patch: &CuratedPatch) -> Result<Event, StoreError> {
        let mut events = self.events.lock().await;
        let event = events.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        event.apply_curation(patch, Utc::now());
        Ok(event.clone())
    }

    async fn delete_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Event>, StoreError> {
        let mut events = self.events.lock().await;
        let stale = events
            .values()
            .filter(|event| event.start_time < cutoff)
            .map(|event| event.id)
            .collect::<Vec<_>>();
        let mut removed = stale
            .into_iter()
            .filter_map(|id| events.remove(&id))
            .collect::<Vec<_>>();
        sort_events(&mut removed);
        Ok(removed)
    }

    async fn distinct_locations(&self) -> Result<Vec<String>, StoreError> {
        let events = self.events.lock().await;
        Ok(events
            .values()
            .map(|event| event.location.name.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect())
    }

    async fn distinct_categories(&self) -> Result<Vec<String>, StoreError> {
        let events = self.events.lock().await;
        Ok(events
            .values()
            .flat_map(|event| event.categories.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect())
    }
}
