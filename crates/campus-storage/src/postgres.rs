use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use campus_core::{
    CuratedPatch, Event, EventDraft, EventId, EventQuery, EventSource, MatchKey, MatchResolver,
    UpsertOutcome,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::{debug, info};

use crate::event_store::{plan_upsert, validate_draft, EventStore, StoreError, UpsertPlan};

/// Every upsert serializes on this key; fuzzy matching can cross title keys.
const UPSERT_LOCK_KEY: &str = "campus-events-upsert";

#[derive(Debug, Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running event store migrations")?;
        info!("event store migrations applied");
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))
    }

    async fn lock_for_update(
        tx: &mut Transaction<'static, Postgres>,
        id: EventId,
    ) -> Result<Event, StoreError> {
        let row = sqlx::query("SELECT data_json FROM events WHERE id = $1 FOR UPDATE")
            .bind(id.0)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        decode_event(&row)
    }
}

fn decode_event(row: &PgRow) -> Result<Event, StoreError> {
    let Json(event) = row.try_get::<Json<Event>, _>("data_json")?;
    Ok(event)
}

fn lowercase_all(values: impl IntoIterator<Item = impl AsRef<str>>) -> Vec<String> {
    values
        .into_iter()
        .map(|value| value.as_ref().trim().to_lowercase())
        .filter(|value| !value.is_empty())
        .collect()
}

fn escape_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

async fn insert_event(
    tx: &mut Transaction<'static, Postgres>,
    event: &Event,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO events (
            id, title, title_key, start_time, end_time, location_name,
            categories_lc, source, data_json, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(event.id.0)
    .bind(&event.title)
    .bind(&event.title_key)
    .bind(event.start_time)
    .bind(event.end_time)
    .bind(&event.location.name)
    .bind(lowercase_all(&event.categories))
    .bind(event.source.as_str())
    .bind(Json(event))
    .bind(event.created_at)
    .bind(event.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn update_event(
    tx: &mut Transaction<'static, Postgres>,
    event: &Event,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE events
           SET title = $2,
               title_key = $3,
               start_time = $4,
               end_time = $5,
               location_name = $6,
               categories_lc = $7,
               source = $8,
               data_json = $9,
               updated_at = $10
         WHERE id = $1
        "#,
    )
    .bind(event.id.0)
    .bind(&event.title)
    .bind(&event.title_key)
    .bind(event.start_time)
    .bind(event.end_time)
    .bind(&event.location.name)
    .bind(lowercase_all(&event.categories))
    .bind(event.source.as_str())
    .bind(Json(event))
    .bind(event.updated_at)
    .execute(&mut **tx)
    .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound(event.id));
    }
    Ok(())
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(())
    }

    async fn upsert(
        &self,
        draft: &EventDraft,
        key: &MatchKey,
        resolver: &dyn MatchResolver,
    ) -> Result<UpsertOutcome, StoreError> {
        validate_draft(draft)?;
        let mut tx = self.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(UPSERT_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        let window = resolver.candidate_window(draft);
        let rows = sqlx::query(
            r#"
            SELECT data_json
              FROM events
             WHERE start_time <= $1
               AND end_time >= $2
             ORDER BY start_time, id
               FOR UPDATE
            "#,
        )
        .bind(window.end)
        .bind(window.start)
        .fetch_all(&mut *tx)
        .await?;
        let candidates = rows.iter().map(decode_event).collect::<Result<Vec<_>, _>>()?;

        let plan = plan_upsert(draft, &candidates, resolver, Utc::now())?;
        let outcome = plan.outcome();
        match &plan {
            UpsertPlan::Insert(event) => insert_event(&mut tx, event).await?,
            UpsertPlan::Update { event, .. } => update_event(&mut tx, event).await?,
            UpsertPlan::Keep { .. } => {}
        }
        tx.commit().await?;

        debug!(
            title_key = %key.title_key,
            location = %key.location_key,
            id = %outcome.id,
            action = ?outcome.action,
            "upsert"
        );
        Ok(outcome)
    }

    async fn query(&self, query: &EventQuery) -> Result<Vec<Event>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT data_json FROM events WHERE TRUE");

        if let Some(text) = query.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            qb.push(" AND title ILIKE ")
                .push_bind(format!("%{}%", escape_like(text)));
        }
        let locations = lowercase_all(&query.locations);
        if !locations.is_empty() {
            qb.push(" AND lower(location_name) = ANY(")
                .push_bind(locations)
                .push(")");
        }
        let categories = lowercase_all(&query.categories);
        if !categories.is_empty() {
            qb.push(" AND categories_lc && ")
                .push_bind(categories)
                .push("::text[]");
        }
        if let Some(from) = query.starts_from {
            qb.push(" AND start_time >= ").push_bind(from);
        }
        if let Some(until) = query.starts_until {
            qb.push(" AND start_time <= ").push_bind(until);
        }
        qb.push(" ORDER BY start_time, id");
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(decode_event).collect()
    }

    async fn get(&self, id: EventId) -> Result<Option<Event>, StoreError> {
        let row = sqlx::query("SELECT data_json FROM events WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode_event).transpose()
    }

    async fn promote(&self, id: EventId, source: EventSource) -> Result<Event, StoreError> {
        let mut tx = self.begin().await?;
        let mut event = Self::lock_for_update(&mut tx, id).await?;
        if event.source != source {
            event.source = source;
            event.updated_at = Utc::now();
            update_event(&mut tx, &event).await?;
        }
        tx.commit().await?;
        Ok(event)
    }

    async fn curate(&self, id: EventId, patch: &CuratedPatch) -> Result<Event, StoreError> {
        let mut tx = self.begin().await?;
        let mut event = Self::lock_for_update(&mut tx, id).await?;
        let changed = event.apply_curation(patch, Utc::now());
        if !changed.is_empty() {
            update_event(&mut tx, &event).await?;
            info!(%id, ?changed, "event curated");
        }
        tx.commit().await?;
        Ok(event)
    }

    async fn delete_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query("DELETE FROM events WHERE start_time < $1 RETURNING data_json")
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
        let mut removed = rows.iter().map(decode_event).collect::<Result<Vec<_>, _>>()?;
        crate::event_store::sort_events(&mut removed);
        Ok(removed)
    }

    async fn distinct_locations(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT DISTINCT location_name FROM events ORDER BY location_name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("location_name").map_err(StoreError::from))
            .collect()
    }

    async fn distinct_categories(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT jsonb_array_elements_text(data_json -> 'categories') AS category
              FROM events
             ORDER BY category
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("category").map_err(StoreError::from))
            .collect()
    }
}
