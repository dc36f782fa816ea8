//! Read-only JSON surface over the event store.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use campus_core::{EventId, EventQuery};
use campus_storage::{EventStore, StoreError};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

const MAX_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EventStore>,
    /// Campus zone used to turn `start_date`/`end_date` into instants.
    pub timezone: Tz,
}

impl AppState {
    pub fn new(store: Arc<dyn EventStore>, timezone: Tz) -> Self {
        Self { store, timezone }
    }
}

/// `locations` and `categories` are comma separated; dates are `YYYY-MM-DD` in campus time.
#[derive(Debug, Deserialize, Default)]
struct EventsQuery {
    query: Option<String>,
    locations: Option<String>,
    categories: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
    limit: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/events", get(events_handler))
        .route("/events/{id}", get(event_detail_handler))
        .route("/locations", get(locations_handler))
        .route("/categories", get(categories_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web surface listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.ping().await {
        Ok(()) => Json(json!({ "status": "ok" })).into_response(),
        Err(err) => store_error(err),
    }
}

async fn events_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<EventsQuery>,
) -> Response {
    let query = match build_query(&params, state.timezone) {
        Ok(query) => query,
        Err(message) => return bad_request(message),
    };
    match state.store.query(&query).await {
        Ok(events) => Json(events).into_response(),
        Err(err) => store_error(err),
    }
}

async fn event_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let Ok(uuid) = Uuid::parse_str(&id) else {
        return bad_request(format!("invalid event id `{id}`"));
    };
    match state.store.get(EventId(uuid)).await {
        Ok(Some(event)) => Json(event).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("event {id} not found") })),
        )
            .into_response(),
        Err(err) => store_error(err),
    }
}

async fn locations_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.distinct_locations().await {
        Ok(locations) => Json(locations).into_response(),
        Err(err) => store_error(err),
    }
}

async fn categories_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.distinct_categories().await {
        Ok(categories) => Json(categories).into_response(),
        Err(err) => store_error(err),
    }
}

fn build_query(params: &EventsQuery, tz: Tz) -> Result<EventQuery, String> {
    let starts_from = params
        .start_date
        .as_deref()
        .map(|d| local_instant(d, NaiveTime::MIN, tz))
        .transpose()?;
    let end_of_day = NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN);
    let starts_until = params
        .end_date
        .as_deref()
        .map(|d| local_instant(d, end_of_day, tz))
        .transpose()?;
    if let (Some(from), Some(until)) = (starts_from, starts_until) {
        if until < from {
            return Err("end_date precedes start_date".to_string());
        }
    }
    Ok(EventQuery {
        text: params.query.clone().filter(|q| !q.trim().is_empty()),
        locations: split_list(params.locations.as_deref()),
        categories: split_list(params.categories.as_deref()),
        starts_from,
        starts_until,
        limit: Some(params.limit.unwrap_or(MAX_LIMIT).min(MAX_LIMIT)),
    })
}

fn local_instant(date: &str, time: NaiveTime, tz: Tz) -> Result<DateTime<Utc>, String> {
    let date = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d")
        .map_err(|_| format!("invalid date `{date}`, expected YYYY-MM-DD"))?;
    tz.from_local_datetime(&date.and_time(time))
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| format!("`{date}` has no such local time"))
}

fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|value| {
        value
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(ToString::to_string)
            .collect()
    })
    .unwrap_or_default()
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

fn store_error(err: StoreError) -> Response {
    let status = match &err {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        err if err.is_unavailable() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warn!(error = %err, status = status.as_u16(), "store request failed");
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}
