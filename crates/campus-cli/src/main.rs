use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use campus_core::{CuratedPatch, EventId, EventSource};
use campus_storage::{EventStore, MemoryEventStore, PgEventStore};
use campus_sync::{build_scheduler, prune_started_events, IngestionCycle, SyncConfig};
use campus_web::AppState;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "campus-cli")]
#[command(about = "Campus events ingestion and query service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion cycle.
    Sync {
        /// Only this source_id from sources.yaml.
        #[arg(long)]
        source: Option<String>,
        /// Merge into a throwaway in-memory store instead of Postgres.
        #[arg(long)]
        in_memory: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Serve the JSON query API; also runs the cron trigger when CAMPUS_SCHEDULER_ENABLED is set.
    Serve,
    /// Run the cron trigger until interrupted.
    Schedule,
    /// Delete events that started more than `--hours` ago.
    Prune {
        #[arg(long)]
        hours: Option<i64>,
    },
    /// Reassign an event's source tag.
    Promote {
        #[arg(long)]
        id: Uuid,
        #[arg(long)]
        source: EventSource,
    },
    /// Apply a JSON patch of curated values to an event.
    Curate {
        #[arg(long)]
        id: Uuid,
        #[arg(long)]
        patch: PathBuf,
    },
}

async fn connect_store(config: &SyncConfig) -> Result<Arc<dyn EventStore>> {
    let store = PgEventStore::connect(&config.database_url)
        .await
        .context("connecting to DATABASE_URL")?;
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync {
        source: None,
        in_memory: false,
    }) {
        Commands::Sync { source, in_memory } => {
            let store: Arc<dyn EventStore> = if in_memory {
                Arc::new(MemoryEventStore::new())
            } else {
                connect_store(&config).await?
            };
            let cycle = IngestionCycle::from_config(&config, store).await?;
            let report = cycle.run(source.as_deref()).await?;
            println!(
                "sync complete: run_id={} inserted={} merged={} unchanged={} fetch_failures={} dropped={} ambiguous={} report={}",
                report.run_id,
                report.inserted,
                report.merged,
                report.unchanged,
                report.fetch_failures.len(),
                report.normalization_failures.len() + report.merge_failures.len(),
                report.ambiguous_matches.len(),
                report.report_path.as_deref().unwrap_or("-")
            );
        }
        Commands::Migrate => {
            let store = PgEventStore::connect(&config.database_url)
                .await
                .context("connecting to DATABASE_URL")?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let store = connect_store(&config).await?;
            let _scheduler = if config.scheduler_enabled {
                let cycle = Arc::new(IngestionCycle::from_config(&config, store.clone()).await?);
                let sched = build_scheduler(cycle, &config.sync_cron).await?;
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.sync_cron, "scheduler started");
                Some(sched)
            } else {
                None
            };
            campus_web::serve(AppState::new(store, config.timezone), config.web_port).await?;
        }
        Commands::Schedule => {
            let store = connect_store(&config).await?;
            let cycle = Arc::new(IngestionCycle::from_config(&config, store).await?);
            let mut sched = build_scheduler(cycle, &config.sync_cron).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler started; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Prune { hours } => {
            let store = connect_store(&config).await?;
            let retention = config.prune_retention(hours)?;
            let removed = prune_started_events(store.as_ref(), retention, Utc::now()).await?;
            println!("pruned {} events", removed.len());
        }
        Commands::Promote { id, source } => {
            let store = connect_store(&config).await?;
            let event = store.promote(EventId(id), source).await?;
            println!("{} is now tagged {}", event.id, event.source.as_str());
        }
        Commands::Curate { id, patch } => {
            let text = tokio::fs::read_to_string(&patch)
                .await
                .with_context(|| format!("reading {}", patch.display()))?;
            let patch: CuratedPatch = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", patch.display()))?;
            let store = connect_store(&config).await?;
            let event = store.curate(EventId(id), &patch).await?;
            println!("{} curated", event.id);
        }
    }

    Ok(())
}
