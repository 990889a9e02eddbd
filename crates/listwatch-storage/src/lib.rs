//! Local JSON persistence, raw page archive and HTTP fetch utilities for listwatch.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use listwatch_core::{PriceHistory, PriceObservation, RawListing};
pub use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "listwatch-storage";

pub const LEDGER_KEY: &str = "price-history.json";
pub const SNAPSHOT_DIR: &str = "data";

/// Write `bytes` to `path` through a sibling temp file and a rename, so readers
/// never observe a half-written file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Key/value JSON documents stored as files below a root directory.
#[derive(Debug, Clone)]
pub struct JsonStore {
    root: PathBuf,
}

impl JsonStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, key: impl AsRef<Path>) -> PathBuf {
        self.root.join(key)
    }

    /// Read and decode a document. Missing or undecodable files yield `None`.
    pub async fn read_json<T: DeserializeOwned>(&self, key: impl AsRef<Path>) -> Option<T> {
        let path = self.path_for(key);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no persisted document");
                return None;
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "persisted document unreadable; treating as absent");
                return None;
            }
        };
        match serde_json::from_str(&text) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "persisted document corrupt; treating as absent");
                None
            }
        }
    }

    pub async fn write_json<T: Serialize + ?Sized>(
        &self,
        key: impl AsRef<Path>,
        value: &T,
    ) -> anyhow::Result<PathBuf> {
        let path = self.path_for(key);
        let bytes = serde_json::to_vec_pretty(value)
            .with_context(|| format!("serializing {}", path.display()))?;
        write_atomic(&path, &bytes).await?;
        Ok(path)
    }
}

pub fn snapshot_key(date: NaiveDate) -> PathBuf {
    PathBuf::from(SNAPSHOT_DIR).join(format!("{}.json", date.format("%Y-%m-%d")))
}

/// Daily snapshots and the price-history ledger on top of a [`JsonStore`].
#[derive(Debug, Clone)]
pub struct ListingStore {
    json: JsonStore,
}

impl ListingStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            json: JsonStore::new(root),
        }
    }

    pub fn json(&self) -> &JsonStore {
        &self.json
    }

    pub async fn save_snapshot(
        &self,
        date: NaiveDate,
        records: &[RawListing],
    ) -> anyhow::Result<PathBuf> {
        self.json.write_json(snapshot_key(date), records).await
    }

    /// Records of a stored snapshot. Elements that do not decode as a listing
    /// come back id-less so they are counted as malformed, not lost.
    pub async fn load_snapshot(&self, date: NaiveDate) -> Vec<RawListing> {
        let key = snapshot_key(date);
        let values: Vec<serde_json::Value> =
            self.json.read_json(&key).await.unwrap_or_default();
        values
            .into_iter()
            .enumerate()
            .map(|(index, value)| {
                serde_json::from_value(value).unwrap_or_else(|err| {
                    warn!(path = %key.display(), index, error = %err, "undecodable snapshot record");
                    RawListing::default()
                })
            })
            .collect()
    }

    /// Dates with a stored snapshot, oldest first.
    pub async fn snapshot_dates(&self) -> anyhow::Result<Vec<NaiveDate>> {
        let dir = self.json.path_for(SNAPSHOT_DIR);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("reading {}", dir.display())),
        };

        let mut dates = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", dir.display()))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            if let Ok(date) = NaiveDate::parse_from_str(stem, "%Y-%m-%d") {
                dates.push(date);
            }
        }
        dates.sort();
        Ok(dates)
    }

    /// Latest snapshot date strictly before `date`.
    pub async fn previous_snapshot_date(
        &self,
        date: NaiveDate,
    ) -> anyhow::Result<Option<NaiveDate>> {
        Ok(self
            .snapshot_dates()
            .await?
            .into_iter()
            .filter(|d| *d < date)
            .max())
    }

    /// Load the price-history ledger. Series that fail to decode are skipped;
    /// if anything was skipped the file on disk is moved aside before the next
    /// save can overwrite it.
    pub async fn load_ledger(&self) -> PriceHistory {
        let path = self.json.path_for(LEDGER_KEY);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no price history yet");
                return PriceHistory::new();
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "price history unreadable; starting empty");
                return PriceHistory::new();
            }
        };

        let (ledger, dropped) = match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(serde_json::Value::Object(entries)) => {
                let mut kept = Vec::with_capacity(entries.len());
                let mut dropped = 0usize;
                for (id, series) in entries {
                    match serde_json::from_value::<Vec<PriceObservation>>(series) {
                        Ok(series) => kept.push((id, series)),
                        Err(err) => {
                            warn!(%id, error = %err, "skipping undecodable price series");
                            dropped += 1;
                        }
                    }
                }
                (kept.into_iter().collect::<PriceHistory>(), dropped)
            }
            Ok(_) => {
                warn!(path = %path.display(), "price history is not an object; starting empty");
                (PriceHistory::new(), 1)
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "price history corrupt; starting empty");
                (PriceHistory::new(), 1)
            }
        };

        if dropped > 0 {
            self.quarantine_ledger(&path).await;
        }
        ledger
    }

    async fn quarantine_ledger(&self, path: &Path) {
        let aside = path.with_file_name(format!(
            "{LEDGER_KEY}.corrupt-{}",
            Utc::now().format("%Y%m%d_%H%M%S")
        ));
        match fs::rename(path, &aside).await {
            Ok(()) => warn!(path = %aside.display(), "kept unreadable price history aside"),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "could not move unreadable price history aside")
            }
        }
    }

    pub async fn save_ledger(&self, ledger: &PriceHistory) -> anyhow::Result<PathBuf> {
        self.json.write_json(LEDGER_KEY, ledger).await
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed archive of fetched listing pages.
#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn page_relative_path(
        fetched_on: NaiveDate,
        source_id: &str,
        content_hash: &str,
    ) -> PathBuf {
        PathBuf::from("raw")
            .join(fetched_on.format("%Y-%m-%d").to_string())
            .join(source_id)
            .join(format!("{content_hash}.html"))
    }

    pub async fn store_page(
        &self,
        fetched_on: NaiveDate,
        source_id: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPage> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::page_relative_path(fetched_on, source_id, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?;
        if !deduplicated {
            write_atomic(&absolute_path, bytes).await?;
        }

        Ok(ArchivedPage {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Sequential page fetcher with a bounded timeout and retry on transient failures.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
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
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        debug!(%status, bytes = body.len(), "fetched page");
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(%status, attempt, "retrying after http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
