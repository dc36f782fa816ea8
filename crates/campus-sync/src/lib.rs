//! Ingestion cycle orchestration: fetch, snapshot, normalize, merge, report.

mod config;
mod dedup;
mod normalize;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use campus_adapters::{FetchContext, FetchOutput, SourceFetcher};
use campus_core::{AmbiguousMatch, Event, EventSource, UpsertAction};
use campus_storage::{EventStore, HttpFetcher, SnapshotStore, StoreError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{ExtractorKind, SourceConfig, SourceMode, SourceRegistry, SyncConfig, DEFAULT_TIMEZONE};
pub use dedup::{DedupConfig, Deduplicator};
pub use normalize::{strip_html, LocationBucket, LocationVocabulary, NormalizationError, Normalizer};

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("event store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),
    #[error("an ingestion cycle is already running")]
    AlreadyRunning,
    #[error("no enabled source named `{0}`")]
    UnknownSource(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStats {
    pub source_id: String,
    pub kind: Option<EventSource>,
    pub fetched: usize,
    pub snapshots: usize,
    pub normalized: usize,
    pub inserted: usize,
    pub merged: usize,
    pub unchanged: usize,
}

/// One dropped source or candidate, kept for the run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub source_id: String,
    pub title: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceStats>,
    pub fetch_failures: Vec<FailureRecord>,
    pub normalization_failures: Vec<FailureRecord>,
    pub merge_failures: Vec<FailureRecord>,
    pub ambiguous_matches: Vec<AmbiguousMatch>,
    pub inserted: usize,
    pub merged: usize,
    pub unchanged: usize,
    pub report_path: Option<String>,
}

impl CycleReport {
    fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            sources: Vec::new(),
            fetch_failures: Vec::new(),
            normalization_failures: Vec::new(),
            merge_failures: Vec::new(),
            ambiguous_matches: Vec::new(),
            inserted: 0,
            merged: 0,
            unchanged: 0,
            report_path: None,
        }
    }

    pub fn source(&self, source_id: &str) -> Option<&SourceStats> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }
}

/// One fetch → normalize → merge pass over the configured sources.
pub struct IngestionCycle {
    store: Arc<dyn EventStore>,
    fetchers: Vec<Arc<dyn SourceFetcher>>,
    normalizer: Normalizer,
    deduplicator: Deduplicator,
    snapshots: SnapshotStore,
    http: HttpFetcher,
    reports_dir: Option<PathBuf>,
    running: Mutex<()>,
}

impl IngestionCycle {
    pub fn new(
        store: Arc<dyn EventStore>,
        fetchers: Vec<Arc<dyn SourceFetcher>>,
        normalizer: Normalizer,
        deduplicator: Deduplicator,
        snapshots: SnapshotStore,
        http: HttpFetcher,
    ) -> Self {
        Self {
            store,
            fetchers,
            normalizer,
            deduplicator,
            snapshots,
            http,
            reports_dir: None,
            running: Mutex::new(()),
        }
    }

    pub fn with_reports_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = Some(dir.into());
        self
    }

    /// Wires fetchers from `sources.yaml` and the vocabulary from `rules/locations.yaml`.
    pub async fn from_config(config: &SyncConfig, store: Arc<dyn EventStore>) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        let registry = SourceRegistry::load(&config.workspace_root).await?;
        let fetchers = registry
            .enabled()
            .map(|source| {
                source
                    .build_fetcher(&config.workspace_root, &http)
                    .with_context(|| format!("building fetcher for {}", source.source_id))
            })
            .collect::<Result<Vec<_>>>()?;
        let vocabulary = LocationVocabulary::from_workspace_root(&config.workspace_root)?;
        info!(sources = fetchers.len(), buckets = vocabulary.len(), "ingestion cycle configured");

        let normalizer = Normalizer::new(config.timezone, vocabulary)?
            .with_default_duration(config.default_duration()?);
        let deduplicator = Deduplicator::new(config.dedup_config()?);
        Ok(Self::new(
            store,
            fetchers,
            normalizer,
            deduplicator,
            SnapshotStore::new(config.artifacts_dir.clone()),
            http,
        )
        .with_reports_dir(config.reports_dir()))
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.fetchers.iter().map(|f| f.source_id().to_string()).collect()
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Runs every enabled source, or only `only`. Overlapping calls fail with
    /// `AlreadyRunning`; an unreachable store is the only other cycle-level error.
    pub async fn run(&self, only: Option<&str>) -> Result<CycleReport, CycleError> {
        let _guard = self.running.try_lock().map_err(|_| CycleError::AlreadyRunning)?;

        let fetchers = match only {
            Some(source_id) => {
                let selected = self
                    .fetchers
                    .iter()
                    .filter(|f| f.source_id() == source_id)
                    .cloned()
                    .collect::<Vec<_>>();
                if selected.is_empty() {
                    return Err(CycleError::UnknownSource(source_id.to_string()));
                }
                selected
            }
            None => self.fetchers.clone(),
        };

        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_cycle", %run_id);
        self.run_sources(run_id, fetchers).instrument(span).await
    }

    async fn run_sources(
        &self,
        run_id: Uuid,
        fetchers: Vec<Arc<dyn SourceFetcher>>,
    ) -> Result<CycleReport, CycleError> {
        let started_at = Utc::now();
        let mut report = CycleReport::new(run_id, started_at);

        self.store.ping().await.map_err(CycleError::StoreUnavailable)?;
        info!(sources = fetchers.len(), "ingestion cycle started");

        let ctx = FetchContext {
            run_id,
            fetched_at: started_at,
            http: self.http.clone(),
        };
        let handles = fetchers
            .iter()
            .map(|fetcher| {
                let fetcher = Arc::clone(fetcher);
                let ctx = ctx.clone();
                tokio::spawn(async move { fetcher.fetch(&ctx).await })
            })
            .collect::<Vec<_>>();

        for (fetcher, handle) in fetchers.iter().zip(handles) {
            let source_id = fetcher.source_id().to_string();
            let mut stats = SourceStats {
                source_id: source_id.clone(),
                kind: Some(fetcher.kind()),
                ..SourceStats::default()
            };
            let fetched = match handle.await {
                Ok(result) => result.map_err(|err| err.to_string()),
                Err(join_err) => Err(format!("fetch task failed: {join_err}")),
            };
            match fetched {
                Ok(output) => {
                    self.ingest_output(&mut report, &mut stats, output).await?;
                }
                Err(error) => {
                    warn!(source_id = %source_id, error = %error, "source fetch failed; skipping");
                    report.fetch_failures.push(FailureRecord {
                        source_id,
                        title: None,
                        error,
                    });
                }
            }
            report.sources.push(stats);
        }

        report.finished_at = Utc::now();
        match self.write_report(&report).await {
            Ok(Some(path)) => report.report_path = Some(path.display().to_string()),
            Ok(None) => {}
            Err(err) => warn!(error = %format!("{err:#}"), "writing cycle report failed"),
        }
        info!(
            inserted = report.inserted,
            merged = report.merged,
            unchanged = report.unchanged,
            fetch_failures = report.fetch_failures.len(),
            normalization_failures = report.normalization_failures.len(),
            merge_failures = report.merge_failures.len(),
            ambiguous = report.ambiguous_matches.len(),
            "ingestion cycle finished"
        );
        Ok(report)
    }

    async fn ingest_output(
        &self,
        report: &mut CycleReport,
        stats: &mut SourceStats,
        output: FetchOutput,
    ) -> Result<(), CycleError> {
        stats.fetched = output.candidates.len();
        for snapshot in &output.snapshots {
            match self
                .snapshots
                .store_bytes(report.run_id, &stats.source_id, &snapshot.extension, &snapshot.bytes)
                .await
            {
                Ok(stored) => {
                    stats.snapshots += 1;
                    debug!(path = %stored.relative_path.display(), deduplicated = stored.deduplicated, "snapshot stored");
                }
                Err(err) => warn!(source_id = %stats.source_id, error = %format!("{err:#}"), "snapshot write failed"),
            }
        }

        let mut written = HashSet::new();
        for candidate in output.candidates {
            let draft = match self.normalizer.normalize(&candidate) {
                Ok(draft) => draft,
                Err(err) => {
                    match &err {
                        NormalizationError::Cancelled(title) => {
                            info!(source_id = %stats.source_id, title = %title, "dropping cancelled event")
                        }
                        other => {
                            warn!(source_id = %stats.source_id, error = %other, "candidate dropped")
                        }
                    }
                    report.normalization_failures.push(FailureRecord {
                        source_id: stats.source_id.clone(),
                        title: candidate.title.clone(),
                        error: err.to_string(),
                    });
                    continue;
                }
            };
            stats.normalized += 1;

            let key = draft.match_key();
            let result = self
                .store
                .upsert(&draft, &key, &self.deduplicator.for_batch(&written))
                .await;
            match result {
                Ok(outcome) => {
                    written.insert(outcome.id);
                    match &outcome.action {
                        UpsertAction::Inserted => {
                            stats.inserted += 1;
                            report.inserted += 1;
                        }
                        UpsertAction::Merged { changed } => {
                            debug!(id = %outcome.id, changed = ?changed, "event merged");
                            stats.merged += 1;
                            report.merged += 1;
                        }
                        UpsertAction::Unchanged => {
                            stats.unchanged += 1;
                            report.unchanged += 1;
                        }
                    }
                    if let Some(ambiguity) = outcome.ambiguity {
                        warn!(
                            title = %ambiguity.title,
                            chosen = %ambiguity.chosen,
                            candidates = ambiguity.candidates.len(),
                            "ambiguous match; merged into the best candidate"
                        );
                        report.ambiguous_matches.push(ambiguity);
                    }
                }
                Err(err) if err.is_unavailable() => return Err(CycleError::StoreUnavailable(err)),
                Err(err) => {
                    warn!(source_id = %stats.source_id, title = %draft.title, error = %err, "merge failed");
                    report.merge_failures.push(FailureRecord {
                        source_id: stats.source_id.clone(),
                        title: Some(draft.title.clone()),
                        error: err.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn write_report(&self, report: &CycleReport) -> Result<Option<PathBuf>> {
        let Some(root) = &self.reports_dir else {
            return Ok(None);
        };
        let dir = root.join(report.run_id.to_string());
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join("cycle_report.json");
        let json = serde_json::to_vec_pretty(report).context("serializing cycle report")?;
        fs::write(&path, json)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(Some(path))
    }
}

/// Cron trigger for the cycle. An overlapping tick is skipped with a warning.
pub async fn build_scheduler(cycle: Arc<IngestionCycle>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let cycle = Arc::clone(&cycle);
        Box::pin(async move {
            match cycle.run(None).await {
                Ok(report) => info!(run_id = %report.run_id, inserted = report.inserted, "scheduled cycle finished"),
                Err(CycleError::AlreadyRunning) => warn!("previous cycle still running; tick skipped"),
                Err(err) => warn!(error = %err, "scheduled cycle failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Deletes events that started more than `retention` before `now`.
pub async fn prune_started_events(
    store: &dyn EventStore,
    retention: Duration,
    now: DateTime<Utc>,
) -> Result<Vec<Event>, StoreError> {
    let cutoff = now - retention;
    let removed = store.delete_started_before(cutoff).await?;
    info!(cutoff = %cutoff, removed = removed.len(), "pruned started events");
    Ok(removed)
}
