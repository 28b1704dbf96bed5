//! Object storage for staged batches + HTTP fetch utilities with retry/backoff.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gcat-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub path: String,
    pub content_hash: String,
    pub byte_size: usize,
    pub unchanged: bool,
}

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object {0} not found")]
    NotFound(String),
    #[error("invalid object path {0:?}")]
    InvalidPath(String),
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Blob storage keyed by slash-separated relative paths.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<StoredObject, ObjectStoreError>;
    async fn get(&self, path: &str) -> Result<Vec<u8>, ObjectStoreError>;
    /// Paths under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError>;
}

fn validate_path(path: &str) -> Result<(), ObjectStoreError> {
    let bad = path.is_empty()
        || path.starts_with('/')
        || path.split('/').any(|part| part.is_empty() || part == "." || part == "..");
    if bad {
        return Err(ObjectStoreError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Filesystem-backed store. Writes go through a temp file and an atomic rename.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ObjectStoreError + '_ {
        move |source| ObjectStoreError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<StoredObject, ObjectStoreError> {
        validate_path(path)?;
        let content_hash = sha256_hex(&bytes);
        let absolute_path = self.root.join(path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent).await.map_err(Self::io_err(&parent))?;

        if let Ok(existing) = fs::read(&absolute_path).await {
            if sha256_hex(&existing) == content_hash {
                return Ok(StoredObject {
                    path: path.to_string(),
                    content_hash,
                    byte_size: bytes.len(),
                    unchanged: true,
                });
            }
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(Self::io_err(&temp_path))?;
        file.write_all(&bytes).await.map_err(Self::io_err(&temp_path))?;
        file.flush().await.map_err(Self::io_err(&temp_path))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(Self::io_err(&absolute_path)(err));
        }

        Ok(StoredObject {
            path: path.to_string(),
            content_hash,
            byte_size: bytes.len(),
            unchanged: false,
        })
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, ObjectStoreError> {
        validate_path(path)?;
        let absolute_path = self.root.join(path);
        match fs::read(&absolute_path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(ObjectStoreError::NotFound(path.to_string()))
            }
            Err(err) => Err(Self::io_err(&absolute_path)(err)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let mut found = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(Self::io_err(&dir)(err)),
            };
            while let Some(entry) = entries.next_entry().await.map_err(Self::io_err(&dir))? {
                let path = entry.path();
                let file_type = entry.file_type().await.map_err(Self::io_err(&path))?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let relative = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if relative.starts_with(prefix) {
                    found.push(relative);
                }
            }
        }
        found.sort();
        Ok(found)
    }
}

/// In-process store, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.objects.lock().await.len()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<StoredObject, ObjectStoreError> {
        validate_path(path)?;
        let content_hash = sha256_hex(&bytes);
        let byte_size = bytes.len();
        let mut objects = self.objects.lock().await;
        let unchanged = objects
            .get(path)
            .is_some_and(|existing| sha256_hex(existing) == content_hash);
        objects.insert(path.to_string(), bytes);
        Ok(StoredObject {
            path: path.to_string(),
            content_hash,
            byte_size,
            unchanged,
        })
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, ObjectStoreError> {
        self.objects
            .lock()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound(path.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        Ok(self
            .objects
            .lock()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Deterministic blob layout for one dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingLayout {
    dataset: String,
}

impl StagingLayout {
    pub fn new(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
        }
    }

    pub fn raw_batch_path(&self, load_date: NaiveDate, seq: u32) -> String {
        format!("raw/{}_{}_{seq}.json", self.dataset, load_date.format("%Y-%m-%d"))
    }

    pub fn cleaned_batch_path(&self, load_date: NaiveDate, seq: u32) -> String {
        format!(
            "processed/{}_cleaned_{}_{seq}.json",
            self.dataset,
            load_date.format("%Y-%m-%d")
        )
    }

    pub fn cleaned_prefix(&self, load_date: NaiveDate) -> String {
        format!(
            "processed/{}_cleaned_{}_",
            self.dataset,
            load_date.format("%Y-%m-%d")
        )
    }

    /// Sequence number of a cleaned batch path for `load_date`.
    pub fn cleaned_seq(&self, load_date: NaiveDate, path: &str) -> Option<u32> {
        path.strip_prefix(&self.cleaned_prefix(load_date))?
            .strip_suffix(".json")?
            .parse()
            .ok()
    }

    pub fn run_summary_path(&self, load_date: NaiveDate, run_id: Uuid) -> String {
        format!("runs/{}/{run_id}.json", load_date.format("%Y-%m-%d"))
    }
}

pub fn encode_ndjson<T: Serialize>(rows: &[T]) -> Result<Vec<u8>, serde_json::Error> {
    let mut out = Vec::new();
    for (i, row) in rows.iter().enumerate() {
        if i > 0 {
            out.push(b'\n');
        }
        serde_json::to_writer(&mut out, row)?;
    }
    Ok(out)
}

pub fn decode_ndjson<T: DeserializeOwned>(bytes: &[u8]) -> Result<Vec<T>, serde_json::Error> {
    bytes
        .split(|b| *b == b'\n')
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
        .map(serde_json::from_slice)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Statuses that are retried; everything else fails the call immediately.
pub const RETRY_STATUSES: [StatusCode; 5] = [
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if RETRY_STATUSES.contains(&status) {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_connect() && !err.is_timeout() {
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
            max_retries: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(120),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

fn retry_after(resp: &reqwest::Response) -> Option<Duration> {
    let secs: u64 = resp.headers().get(RETRY_AFTER)?.to_str().ok()?.trim().parse().ok()?;
    Some(Duration::from_secs(secs))
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
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
    #[error("invalid json from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("http client building failed: {0}")]
    Build(String),
    #[error("fetch limiter closed")]
    LimiterClosed,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder
            .build()
            .map_err(|err| FetchError::Build(err.to_string()))?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    /// GET with retries on [`RETRY_STATUSES`] and connection errors.
    pub async fn fetch_bytes(
        &self,
        url: &str,
        timeout: Option<Duration>,
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;

        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url, timeout).instrument(span).await
    }

    async fn fetch_with_retries(
        &self,
        url: &str,
        timeout: Option<Duration>,
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let mut request = self.client.get(url);
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }

            match request.send().await {
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
                        let backoff = self.backoff.delay_for_attempt(attempt);
                        let delay = retry_after(&resp)
                            .map_or(backoff, |hint| hint.max(backoff))
                            .min(self.backoff.max_delay);
                        debug!(status = status.as_u16(), attempt, ?delay, "retrying");
                        tokio::time::sleep(delay).await;
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
                        warn!(attempt, error = %err, "request failed, retrying");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }

    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        url: &str,
        timeout: Option<Duration>,
    ) -> Result<T, FetchError> {
        let response = self.fetch_bytes(url, timeout).await?;
        serde_json::from_slice(&response.body).map_err(|source| FetchError::Decode {
            url: response.final_url,
            source,
        })
    }
}
