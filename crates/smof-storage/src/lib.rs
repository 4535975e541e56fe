//! Run-local persistence for SMOF: hash-addressed raw payload archive,
//! per-run listing snapshots (the prior-run dedupe input), and the rate-limited
//! marketplace HTTP fetcher.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use smof_core::Listing;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "smof-storage";

/// Result of archiving one raw scrape payload.
#[derive(Debug, Clone)]
pub struct StoredPayload {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    /// True when an identical payload was already archived.
    pub reused_existing: bool,
}

/// Immutable archive of raw marketplace payloads, addressed by content hash
/// so re-scraping an unchanged page costs nothing.
#[derive(Debug, Clone)]
pub struct RawPayloadArchive {
    root: PathBuf,
}

impl RawPayloadArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn payload_relative_path(
        source_id: &str,
        fetched_at: DateTime<Utc>,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let day = fetched_at.format("%Y%m%d").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(source_id)
            .join(day)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Archive bytes under their content hash with an atomic temp-file rename.
    pub async fn store(
        &self,
        source_id: &str,
        fetched_at: DateTime<Utc>,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredPayload> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            Self::payload_relative_path(source_id, fetched_at, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating payload directory {}", parent.display()))?;
        }

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking payload path {}", absolute_path.display()))?
        {
            return Ok(StoredPayload {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                reused_existing: true,
            });
        }

        let parent = absolute_path
            .parent()
            .expect("payload path always has a parent");
        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp payload file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp payload file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp payload file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredPayload {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                reused_existing: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(StoredPayload {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    reused_existing: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp payload {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

/// On-disk snapshot of one run's normalized listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub listings: Vec<Listing>,
}

/// The prior run as loaded back for cross-run dedup. Read-only input; the
/// pipeline never rewrites an earlier snapshot.
#[derive(Debug, Clone)]
pub struct PriorRun {
    pub directory: String,
    pub snapshot: RunSnapshot,
}

/// Per-run listing snapshots under `runs/<stamp>-<run_id>/listings.json`.
/// Directory names sort lexicographically by timestamp, so the latest
/// snapshot is always the last name.
#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn run_dir_name(started_at: DateTime<Utc>, run_id: Uuid) -> String {
        format!("{}-{}", started_at.format("%Y%m%dT%H%M%SZ"), run_id)
    }

    /// Persist the current run's listings for the next run to dedupe against.
    pub async fn persist_run(&self, snapshot: &RunSnapshot) -> anyhow::Result<PathBuf> {
        let dir = self
            .root
            .join(Self::run_dir_name(snapshot.started_at, snapshot.run_id));
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating run directory {}", dir.display()))?;

        let bytes = serde_json::to_vec_pretty(snapshot).context("serializing run snapshot")?;
        let final_path = dir.join("listings.json");
        let temp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));
        fs::write(&temp_path, &bytes)
            .await
            .with_context(|| format!("writing {}", temp_path.display()))?;
        fs::rename(&temp_path, &final_path)
            .await
            .with_context(|| format!("renaming into {}", final_path.display()))?;
        Ok(final_path)
    }

    /// Load the most recent snapshot, if any. Snapshots the pipeline cannot
    /// parse are skipped rather than failing the run.
    pub async fn load_prior_run(&self) -> anyhow::Result<Option<PriorRun>> {
        if !fs::try_exists(&self.root)
            .await
            .with_context(|| format!("checking {}", self.root.display()))?
        {
            return Ok(None);
        }

        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("reading {}", self.root.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();

        for name in names.into_iter().rev() {
            let path = self.root.join(&name).join("listings.json");
            let Ok(text) = fs::read_to_string(&path).await else {
                continue;
            };
            match serde_json::from_str::<RunSnapshot>(&text) {
                Ok(snapshot) => {
                    return Ok(Some(PriorRun {
                        directory: name,
                        snapshot,
                    }))
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "skipping unreadable run snapshot");
                }
            }
        }
        Ok(None)
    }
}

/// Exponential backoff schedule for marketplace fetches.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

fn status_is_retryable(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn error_is_retryable(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    /// Minimum spacing between requests to the same marketplace; scraping
    /// politeness carried over from the source sites' tolerance.
    pub per_source_spacing: Duration,
    pub retry: RetryPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            per_source_concurrency: 2,
            per_source_spacing: Duration::from_secs(2),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPayload {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Bounded-concurrency HTTP fetcher with per-source request spacing and
/// retry-with-backoff on transient failures.
#[derive(Debug)]
pub struct MarketplaceFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    next_slot: Mutex<HashMap<String, Instant>>,
    spacing: Duration,
    retry: RetryPolicy,
}

impl MarketplaceFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            next_slot: Mutex::new(HashMap::new()),
            spacing: config.per_source_spacing,
            retry: config.retry,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// Reserve the next send slot for this source and sleep until it opens.
    async fn wait_for_slot(&self, source_id: &str) {
        let ready_at = {
            let mut map = self.next_slot.lock().await;
            let now = Instant::now();
            let ready_at = match map.get(source_id) {
                Some(slot) if *slot > now => *slot,
                _ => now,
            };
            map.insert(source_id.to_string(), ready_at + self.spacing);
            ready_at
        };
        tokio::time::sleep_until(ready_at).await;
    }

    pub async fn fetch(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedPayload, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        let span = info_span!("marketplace_fetch", %run_id, source_id, url);
        let _guard = span.enter();

        let mut attempt = 0usize;
        loop {
            self.wait_for_slot(source_id).await;

            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedPayload {
                            status,
                            final_url,
                            body,
                        });
                    }
                    if status_is_retryable(status) && attempt < self.retry.max_retries {
                        tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if error_is_retryable(&err) && attempt < self.retry.max_retries {
                        tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
