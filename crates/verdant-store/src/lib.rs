//! Document-store interface, raw-payload archive and HTTP fetch utilities.
//!
//! The persistence engine behind the dashboard is deployment-provided; the
//! ingestion core only depends on the [`DocumentStore`] trait, with
//! [`MemoryStore`] as the in-process backend used by tests and the CLI.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
pub use serde_json::Value as Document;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::info_span;
use uuid::Uuid;

pub const EMISSIONS_COLLECTION: &str = "emissions";
pub const ENERGY_COLLECTION: &str = "energy";
pub const METADATA_COLLECTION: &str = "metadata";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("encoding document: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// The filter subset the ingestion core needs: key equality for upserts,
/// provenance exclusion + year range for the staleness count, and the fixed
/// type key for the metadata singleton.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub country: Option<String>,
    pub year: Option<i32>,
    pub year_range: Option<(i32, i32)>,
    pub provenance_not: Option<String>,
    pub doc_type: Option<String>,
    pub updated_since: Option<DateTime<Utc>>,
}

impl Filter {
    /// Natural-key filter for record upserts.
    pub fn key(country: &str, year: i32) -> Self {
        Self {
            country: Some(country.to_string()),
            year: Some(year),
            ..Self::default()
        }
    }

    pub fn doc_type(type_key: &str) -> Self {
        Self {
            doc_type: Some(type_key.to_string()),
            ..Self::default()
        }
    }

    pub fn years(mut self, start: i32, end: i32) -> Self {
        self.year_range = Some((start, end));
        self
    }

    pub fn provenance_not(mut self, provenance: &str) -> Self {
        self.provenance_not = Some(provenance.to_string());
        self
    }

    pub fn updated_since(mut self, since: DateTime<Utc>) -> Self {
        self.updated_since = Some(since);
        self
    }

    pub fn matches(&self, doc: &Document) -> bool {
        if let Some(country) = &self.country {
            if doc.get("country").and_then(Document::as_str) != Some(country.as_str()) {
                return false;
            }
        }
        if let Some(year) = self.year {
            if doc.get("year").and_then(Document::as_i64) != Some(i64::from(year)) {
                return false;
            }
        }
        if let Some((start, end)) = self.year_range {
            match doc.get("year").and_then(Document::as_i64) {
                Some(y) if y >= i64::from(start) && y <= i64::from(end) => {}
                _ => return false,
            }
        }
        if let Some(excluded) = &self.provenance_not {
            if doc.get("provenance").and_then(Document::as_str) == Some(excluded.as_str()) {
                return false;
            }
        }
        if let Some(type_key) = &self.doc_type {
            if doc.get("type").and_then(Document::as_str) != Some(type_key.as_str()) {
                return false;
            }
        }
        if let Some(since) = self.updated_since {
            let updated_at = doc
                .get("updated_at")
                .and_then(Document::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc));
            match updated_at {
                Some(t) if t >= since => {}
                _ => return false,
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
}

/// Generic keyed document collections: replace-or-insert by filter, count,
/// and single-document lookup. Matches the write-path surface the dashboard
/// deployment's store exposes.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn upsert_by_key(
        &self,
        collection: &str,
        key: &Filter,
        replacement: Document,
    ) -> Result<UpsertOutcome, StoreError>;

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError>;

    async fn find_one(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Option<Document>, StoreError>;
}

/// In-memory document store. Whole-document replacement on upsert, so a
/// matched key never ends up with merged field sets.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<Document>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn upsert_by_key(
        &self,
        collection: &str,
        key: &Filter,
        replacement: Document,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection.to_string()).or_default();
        match docs.iter_mut().find(|doc| key.matches(doc)) {
            Some(existing) => {
                *existing = replacement;
                Ok(UpsertOutcome::Replaced)
            }
            None => {
                docs.push(replacement);
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|docs| docs.iter().filter(|doc| filter.matches(doc)).count() as u64)
            .unwrap_or(0))
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Option<Document>, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.iter().find(|doc| filter.matches(doc)).cloned()))
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedPayload {
    pub sha256: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_len: usize,
    pub deduplicated: bool,
}

/// Hash-addressed archive of raw provider payloads, written before parsing
/// so a bad reconciliation can be replayed against the exact bytes fetched.
#[derive(Debug, Clone)]
pub struct RawArchive {
    root: PathBuf,
}

impl RawArchive {
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
        provider: &str,
        fetched_at: DateTime<Utc>,
        sha256: &str,
        extension: &str,
    ) -> PathBuf {
        let day = fetched_at.format("%Y%m%d").to_string();
        let ext = extension.trim_start_matches('.');
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(provider).join(day).join(format!("{sha256}.{ext}"))
    }

    /// Store a payload immutably via temp file + atomic rename. Identical
    /// bytes from the same provider/day land on the same path and are
    /// reported as deduplicated instead of rewritten.
    pub async fn store_payload(
        &self,
        provider: &str,
        fetched_at: DateTime<Utc>,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPayload> {
        let sha256 = Self::sha256_hex(bytes);
        let relative_path = Self::payload_relative_path(provider, fetched_at, &sha256, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .context("archive path always has a parent")?;
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(ArchivedPayload {
                sha256,
                relative_path,
                absolute_path,
                byte_len: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(ArchivedPayload {
                sha256,
                relative_path,
                absolute_path,
                byte_len: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(ArchivedPayload {
                    sha256,
                    relative_path,
                    absolute_path,
                    byte_len: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp archive file {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
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
    if err.is_timeout() || err.is_connect() || err.is_request() {
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
            max_retries: 3,
            base_delay: Duration::from_millis(250),
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
    pub global_concurrency: usize,
    pub per_provider_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            global_concurrency: 8,
            per_provider_concurrency: 4,
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

impl FetchedResponse {
    pub fn text(&self) -> Result<String, FetchError> {
        String::from_utf8(self.body.clone()).map_err(|_| FetchError::NotUtf8 {
            url: self.final_url.clone(),
        })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response body for {url} is not utf-8")]
    NotUtf8 { url: String },
}

impl FetchError {
    /// Whether the failure means the provider is unreachable rather than
    /// answering with an error payload.
    pub fn is_transport(&self) -> bool {
        matches!(self, FetchError::Request(_))
    }
}

/// Shared HTTP client with retry/backoff and bounded concurrency, globally
/// and per provider.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_provider_limit: usize,
    per_provider: Mutex<HashMap<String, Arc<Semaphore>>>,
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
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_provider_limit: config.per_provider_concurrency.max(1),
            per_provider: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn provider_semaphore(&self, provider: &str) -> Arc<Semaphore> {
        let mut map = self.per_provider.lock().await;
        map.entry(provider.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_provider_limit)))
            .clone()
    }

    pub async fn fetch_bytes(&self, provider: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");
        let per_provider = self.provider_semaphore(provider).await;
        let _provider = per_provider.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", provider, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;
        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
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
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop captures a request error"),
        ))
    }

    pub async fn fetch_text(&self, provider: &str, url: &str) -> Result<String, FetchError> {
        self.fetch_bytes(provider, url).await?.text()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn upsert_replaces_whole_document_for_matching_key() {
        let store = MemoryStore::new();
        let key = Filter::key("Germany", 2023);

        let first = store
            .upsert_by_key(
                EMISSIONS_COLLECTION,
                &key,
                json!({"country": "Germany", "year": 2023, "co2_emissions": 700.0, "population": 1}),
            )
            .await
            .unwrap();
        let second = store
            .upsert_by_key(
                EMISSIONS_COLLECTION,
                &key,
                json!({"country": "Germany", "year": 2023, "co2_emissions": 759.0}),
            )
            .await
            .unwrap();

        assert_eq!(first, UpsertOutcome::Inserted);
        assert_eq!(second, UpsertOutcome::Replaced);
        assert_eq!(store.count(EMISSIONS_COLLECTION, &key).await.unwrap(), 1);

        let doc = store
            .find_one(EMISSIONS_COLLECTION, &key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc["co2_emissions"], 759.0);
        // full replacement, not field merge
        assert!(doc.get("population").is_none());
    }

    #[tokio::test]
    async fn filters_match_year_range_and_excluded_provenance() {
        let store = MemoryStore::new();
        for (year, provenance) in [(2019, "owid"), (2021, "owid"), (2022, "synthetic")] {
            store
                .upsert_by_key(
                    EMISSIONS_COLLECTION,
                    &Filter::key("France", year),
                    json!({"country": "France", "year": year, "provenance": provenance}),
                )
                .await
                .unwrap();
        }

        let real_recent = Filter::default()
            .years(2020, 2023)
            .provenance_not("synthetic");
        assert_eq!(
            store.count(EMISSIONS_COLLECTION, &real_recent).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn filter_updated_since_reads_rfc3339_timestamps() {
        let store = MemoryStore::new();
        store
            .upsert_by_key(
                METADATA_COLLECTION,
                &Filter::doc_type("data_source"),
                json!({"type": "data_source", "updated_at": "2026-08-01T00:00:00Z"}),
            )
            .await
            .unwrap();

        let fresh = Filter::doc_type("data_source")
            .updated_since("2026-07-30T00:00:00Z".parse().unwrap());
        let stale = Filter::doc_type("data_source")
            .updated_since("2026-08-02T00:00:00Z".parse().unwrap());
        assert!(store
            .find_one(METADATA_COLLECTION, &fresh)
            .await
            .unwrap()
            .is_some());
        assert!(store
            .find_one(METADATA_COLLECTION, &stale)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn archive_deduplicates_identical_payloads() {
        let dir = tempdir().expect("tempdir");
        let archive = RawArchive::new(dir.path());
        let fetched_at = "2026-08-08T06:00:00Z".parse::<DateTime<Utc>>().unwrap();

        let first = archive
            .store_payload("owid", fetched_at, "csv", b"country,year\nChile,2023\n")
            .await
            .expect("first store");
        let second = archive
            .store_payload("owid", fetched_at, "csv", b"country,year\nChile,2023\n")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.sha256, second.sha256);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn backoff_delays_double_and_cap() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }
}
