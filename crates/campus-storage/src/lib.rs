//! Raw snapshot storage, HTTP fetch utilities and the canonical event store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

mod event_store;
mod postgres;

pub use event_store::{EventStore, MemoryEventStore, StoreError};
pub use postgres::PgEventStore;

/// Where one source payload of one cycle landed.
#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub content_hash: String,
    /// `<run_id>/<source_id>/<sha256>.<ext>` under the snapshot root.
    pub relative_path: PathBuf,
    /// The same payload was already stored for this cycle and source.
    pub deduplicated: bool,
}

/// Raw payloads (XML, HTML, JSON) kept per ingestion cycle for auditing. Nothing in
/// the pipeline reads them back.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    fn cycle_path(run_id: Uuid, source_id: &str, content_hash: &str, extension: &str) -> PathBuf {
        let extension = match extension.trim().trim_start_matches('.') {
            "" => "bin",
            ext => ext,
        };
        [run_id.to_string(), source_id.to_string(), format!("{content_hash}.{extension}")]
            .iter()
            .collect()
    }

    /// Files the payload under the cycle that fetched it. Pages repeated within one
    /// cycle are stored once.
    pub async fn store_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredSnapshot> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::cycle_path(run_id, source_id, &content_hash, extension);
        let target = self.root.join(&relative_path);

        let deduplicated = fs::try_exists(&target)
            .await
            .with_context(|| format!("checking snapshot {}", target.display()))?;
        if !deduplicated {
            write_atomically(&target, bytes).await?;
        }
        Ok(StoredSnapshot {
            content_hash,
            relative_path,
            deduplicated,
        })
    }
}

/// Readers never see a half-written snapshot: bytes go to a sibling temp file first.
async fn write_atomically(target: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let dir = target.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating snapshot directory {}", dir.display()))?;

    let partial = dir.join(format!(".{}.partial", Uuid::new_v4().simple()));
    fs::write(&partial, bytes)
        .await
        .with_context(|| format!("writing {}", partial.display()))?;
    if let Err(err) = fs::rename(&partial, target).await {
        let _ = fs::remove_file(&partial).await;
        return Err(err).with_context(|| format!("moving snapshot into {}", target.display()));
    }
    Ok(())
}

/// Doubling delay between attempts, capped at `ceiling`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub first_delay: Duration,
    pub ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            first_delay: Duration::from_millis(500),
            ceiling: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    fn delay(&self, retry: u32) -> Duration {
        2u32.checked_pow(retry)
            .map_or(self.ceiling, |factor| self.first_delay.saturating_mul(factor))
            .min(self.ceiling)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Requests in flight across every source of a cycle.
    pub max_in_flight: usize,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_in_flight: 4,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, HttpError::Request(err) if err.is_timeout())
    }

    /// Throttling, server faults and dropped connections are worth another attempt.
    fn is_transient(&self) -> bool {
        match self {
            HttpError::HttpStatus { status, .. } => *status == 429 || (500..600).contains(status),
            HttpError::Request(err) => err.is_timeout() || err.is_connect() || err.is_request(),
        }
    }
}

/// GET client shared by every source fetcher of a cycle.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = config.user_agent {
            builder = builder.user_agent(user_agent);
        }
        Ok(Self {
            client: builder.build().context("building http client")?,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            retry: config.retry,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, HttpError> {
        let span = info_span!("http_fetch", %run_id, source_id, url);
        async {
            // Never closed, so a failed acquire only means no limit applies.
            let _permit = self.in_flight.acquire().await.ok();
            let mut retry = 0;
            loop {
                match self.get_once(url).await {
                    Err(err) if retry < self.retry.retries && err.is_transient() => {
                        let delay = self.retry.delay(retry);
                        debug!(error = %err, retry, ?delay, "transient fetch failure");
                        tokio::time::sleep(delay).await;
                        retry += 1;
                    }
                    outcome => return outcome,
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn get_once(&self, url: &str) -> Result<FetchedResponse, HttpError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Err(HttpError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = response.bytes().await?.to_vec();
        debug!(bytes = body.len(), "fetched");
        Ok(FetchedResponse { final_url, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn content_hash_is_sha256() {
        assert_eq!(
            SnapshotStore::sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn snapshots_are_grouped_by_cycle_and_source() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let run_id = Uuid::new_v4();

        let first = store
            .store_bytes(run_id, "hub-rss", "xml", b"<rss>same</rss>")
            .await
            .expect("first store");
        let repeat = store
            .store_bytes(run_id, "hub-rss", ".xml", b"<rss>same</rss>")
            .await
            .expect("repeat store");
        assert!(!first.deduplicated);
        assert!(repeat.deduplicated);
        assert_eq!(first.relative_path, repeat.relative_path);
        assert_eq!(
            first.relative_path,
            PathBuf::from(run_id.to_string())
                .join("hub-rss")
                .join(format!("{}.xml", first.content_hash))
        );
        assert!(dir.path().join(&first.relative_path).exists());

        let next_cycle = store
            .store_bytes(Uuid::new_v4(), "hub-rss", "xml", b"<rss>same</rss>")
            .await
            .expect("next cycle");
        assert!(!next_cycle.deduplicated);
        assert_ne!(next_cycle.relative_path, first.relative_path);

        let untyped = store
            .store_bytes(run_id, "daily-mammoth", "", b"[]")
            .await
            .expect("untyped");
        assert_eq!(untyped.relative_path.extension().and_then(|e| e.to_str()), Some("bin"));
    }

    #[test]
    fn retry_delay_doubles_up_to_the_ceiling() {
        let policy = RetryPolicy {
            retries: 5,
            first_delay: Duration::from_millis(100),
            ceiling: Duration::from_millis(350),
        };
        let delays = (0..4).map(|retry| policy.delay(retry)).collect::<Vec<_>>();
        assert_eq!(delays, [100, 200, 350, 350].map(Duration::from_millis).to_vec());
        assert_eq!(policy.delay(64), Duration::from_millis(350));
    }

    #[test]
    fn throttling_and_server_faults_are_transient() {
        let status = |status| HttpError::HttpStatus {
            status,
            url: "https://thehub.example.edu/events.rss".into(),
        };
        assert!(status(502).is_transient());
        assert!(status(429).is_transient());
        assert!(!status(404).is_transient());
        assert!(!status(403).is_timeout());
    }
}
