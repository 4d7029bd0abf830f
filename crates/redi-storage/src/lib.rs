//! Snapshot storage, HTTP fetch utilities and store/cache seams for REDI.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub mod cache;
pub mod records;

pub use cache::{CacheError, CacheStore, MemoryCache, NoopCache, RedisCache};
pub use records::{MemoryRecordStore, PgRecordStore, RecordStore, StoreError};

pub const CRATE_NAME: &str = "redi-storage";

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Append-only store for per-run audit snapshots, one JSON artifact per run date.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
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

    pub fn primary_relative_path(run_date: &str) -> PathBuf {
        PathBuf::from(format!("snapshot-{}.json", sanitize_run_date(run_date)))
    }

    pub fn fallback_relative_path(run_date: &str, content_hash: &str) -> PathBuf {
        let short = &content_hash[..content_hash.len().min(12)];
        PathBuf::from(format!("snapshot-{}-{short}.json", sanitize_run_date(run_date)))
    }

    /// Store a snapshot without ever overwriting an existing artifact.
    ///
    /// The first snapshot of a date lands at `snapshot-<date>.json`. A later
    /// snapshot with different content on the same date gets a hash-suffixed
    /// name; identical content is reported as deduplicated.
    pub async fn store_snapshot(
        &self,
        run_date: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredSnapshot> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating snapshot directory {}", self.root.display()))?;

        let content_hash = Self::sha256_hex(bytes);
        let primary = Self::primary_relative_path(run_date);
        let fallback = Self::fallback_relative_path(run_date, &content_hash);

        for relative_path in [primary, fallback] {
            let absolute_path = self.root.join(&relative_path);
            let exists = fs::try_exists(&absolute_path)
                .await
                .with_context(|| format!("checking snapshot path {}", absolute_path.display()))?;

            if exists {
                let existing = fs::read(&absolute_path)
                    .await
                    .with_context(|| format!("reading snapshot {}", absolute_path.display()))?;
                if Self::sha256_hex(&existing) == content_hash {
                    return Ok(StoredSnapshot {
                        content_hash,
                        relative_path,
                        absolute_path,
                        byte_size: bytes.len(),
                        deduplicated: true,
                    });
                }
                continue;
            }

            self.write_atomically(&absolute_path, bytes).await?;
            return Ok(StoredSnapshot {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            });
        }

        anyhow::bail!(
            "snapshot for {run_date} already exists with different content under both names"
        )
    }

    async fn write_atomically(&self, absolute_path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp snapshot file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp snapshot {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }
        Ok(())
    }
}

fn sanitize_run_date(run_date: &str) -> String {
    run_date
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
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
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
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

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

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

    /// GET `url` as JSON, retrying transient failures with exponential backoff.
    pub async fn fetch_json_bytes(
        &self,
        run_id: Uuid,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, url = %redact_query(url));
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let resp_result = self
                .client
                .get(url)
                .header(ACCEPT, "application/json")
                .send()
                .await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let content_type = resp
                        .headers()
                        .get(reqwest::header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(ToString::to_string);

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        debug!(bytes = body.len(), attempt, "fetch succeeded");
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            content_type,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(status = status.as_u16(), attempt, "retryable http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: redact_query(&final_url),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retryable request error");
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

/// Strip the query string so API keys never reach logs or error messages.
pub fn redact_query(url: &str) -> String {
    match url.split_once('?') {
        Some((base, _)) => format!("{base}?<redacted>"),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn snapshot_hashing_is_stable() {
        let hash = SnapshotStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn snapshots_are_append_only_per_run_date() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path().join("snapshots"));

        let first = store
            .store_snapshot("2024-05-01", b"{\"run\":1}")
            .await
            .expect("first store");
        let repeat = store
            .store_snapshot("2024-05-01", b"{\"run\":1}")
            .await
            .expect("repeat store");
        let second = store
            .store_snapshot("2024-05-01", b"{\"run\":2}")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert_eq!(first.relative_path, PathBuf::from("snapshot-2024-05-01.json"));
        assert!(repeat.deduplicated);
        assert!(!second.deduplicated);
        assert_ne!(second.relative_path, first.relative_path);
        assert!(second
            .relative_path
            .to_string_lossy()
            .starts_with("snapshot-2024-05-01-"));

        let original = std::fs::read(&first.absolute_path).expect("read first");
        assert_eq!(original, b"{\"run\":1}");
    }

    #[test]
    fn run_date_is_sanitized_into_file_name() {
        assert_eq!(
            SnapshotStore::primary_relative_path("2024/05/01"),
            PathBuf::from("snapshot-2024_05_01.json")
        );
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
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

    #[test]
    fn status_classification_retries_server_errors_only() {
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn query_strings_are_redacted() {
        assert_eq!(
            redact_query("https://api.example/resource?api-key=secret&format=json"),
            "https://api.example/resource?<redacted>"
        );
        assert_eq!(redact_query("https://api.example/x"), "https://api.example/x");
    }
}
