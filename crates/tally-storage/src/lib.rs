//! Store contracts, a JSON-file-backed store, and the external stats client.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use tally_core::{AttributionWindow, Post, Project, UserActivity};

pub const CRATE_NAME: &str = "tally-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed store document: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown project {0}")]
    UnknownProject(String),
    #[error("unknown post {0}")]
    UnknownPost(String),
}

/// Read/write access to the projects the sync engine aggregates onto.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn list_projects(&self) -> Result<Vec<Project>, StoreError>;
    async fn set_project_total_seconds(&self, id: &str, seconds: f64) -> Result<(), StoreError>;
}

/// Read/write access to the posts whose time windows get attributed.
#[async_trait]
pub trait PostStore: Send + Sync {
    async fn list_posts_for_sync(&self) -> Result<Vec<Post>, StoreError>;
    async fn set_post_total_seconds(&self, id: &str, seconds: f64) -> Result<(), StoreError>;
}

/// Everything the store file holds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreDocument {
    #[serde(default)]
    pub projects: Vec<Project>,
    #[serde(default)]
    pub posts: Vec<Post>,
}

/// Single-file JSON store implementing both contracts.
///
/// Writes land in a uniquely named temp file first and are renamed into
/// place, so an interrupted write never truncates the document.
#[derive(Debug)]
pub struct JsonStore {
    path: PathBuf,
    doc: Mutex<StoreDocument>,
}

impl JsonStore {
    /// Opens the store at `path`, starting from an empty document when the
    /// file does not exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let doc = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => StoreDocument::default(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn snapshot(&self) -> StoreDocument {
        self.doc.lock().await.clone()
    }

    async fn persist(&self, doc: &StoreDocument) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(doc)?;
        let temp_name = format!(".{}.tmp", Uuid::new_v4());
        let temp_path = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join(temp_name),
            _ => PathBuf::from(temp_name),
        };

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        drop(file);

        match fs::rename(&temp_path, &self.path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err.into())
            }
        }
    }
}

#[async_trait]
impl ProjectStore for JsonStore {
    async fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        Ok(self.doc.lock().await.projects.clone())
    }

    async fn set_project_total_seconds(&self, id: &str, seconds: f64) -> Result<(), StoreError> {
        let mut doc = self.doc.lock().await;
        let project = doc
            .projects
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| StoreError::UnknownProject(id.to_string()))?;
        project.total_seconds = Some(seconds);
        let snapshot = doc.clone();
        drop(doc);
        self.persist(&snapshot).await
    }
}

#[async_trait]
impl PostStore for JsonStore {
    async fn list_posts_for_sync(&self) -> Result<Vec<Post>, StoreError> {
        Ok(self.doc.lock().await.posts.clone())
    }

    async fn set_post_total_seconds(&self, id: &str, seconds: f64) -> Result<(), StoreError> {
        let mut doc = self.doc.lock().await;
        let post = doc
            .posts
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| StoreError::UnknownPost(id.to_string()))?;
        post.total_seconds = Some(seconds);
        let snapshot = doc.clone();
        drop(doc);
        self.persist(&snapshot).await
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

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Source of per-user external activity.
///
/// `None` means "no activity available for this user in this run". Callers
/// must treat it as empty, never as a fatal error.
#[async_trait]
pub trait ActivitySource: Send + Sync {
    async fn fetch_activity(
        &self,
        external_user_id: &str,
        window: AttributionWindow,
    ) -> Option<UserActivity>;
}

#[derive(Debug, Clone)]
pub struct StatsClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for StatsClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://hackatime.hackclub.com/api/v1".to_string(),
            api_key: None,
            timeout: Duration::from_secs(20),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// HTTP client for the third-party stats endpoint. One logical fetch per
/// user/window; 5xx, 429, timeouts, and connect errors are retried with
/// capped exponential backoff, everything else fails the fetch immediately.
#[derive(Debug)]
pub struct StatsClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Deserialize)]
struct StatsResponse {
    data: StatsData,
}

#[derive(Debug, Default, Deserialize)]
struct StatsData {
    #[serde(default)]
    projects: Vec<tally_core::ProjectTime>,
}

impl StatsClient {
    pub fn new(config: StatsClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building stats http client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
            backoff: config.backoff,
        })
    }

    fn stats_url(&self, external_user_id: &str, window: AttributionWindow) -> String {
        format!(
            "{}/users/{}/stats?features=projects&start_date={}&end_date={}",
            self.base_url,
            external_user_id,
            window.start.format("%Y-%m-%d"),
            window.end.format("%Y-%m-%d"),
        )
    }

    async fn request_stats(&self, url: &str) -> Result<StatsResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let mut request = self.client.get(url);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.json::<StatsResponse>().await?);
                    }
                    if classify_status(status) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: url.to_string(),
                        });
                    }
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(FetchError::Request(err));
                    }
                }
            }

            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl ActivitySource for StatsClient {
    async fn fetch_activity(
        &self,
        external_user_id: &str,
        window: AttributionWindow,
    ) -> Option<UserActivity> {
        let url = self.stats_url(external_user_id, window);
        match self.request_stats(&url).await {
            Ok(resp) => Some(UserActivity {
                projects: resp.data.projects,
            }),
            Err(err) => {
                warn!(
                    user = external_user_id,
                    error = %err,
                    "external stats fetch failed; treating as no activity"
                );
                None
            }
        }
    }
}

/// Async token bucket used to pace store writes between items, replacing a
/// hard-coded inter-write sleep with a configurable policy.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<BucketState>,
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            refill_every,
            state: Mutex::new(BucketState {
                tokens: capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Waits until a token is available and consumes it. A zero refill
    /// interval disables pacing entirely.
    pub async fn take(&self) {
        if self.refill_every.is_zero() {
            return;
        }

        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            drop(state);
            tokio::time::sleep(self.refill_every).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn window(start: (i32, u32, u32), end: (i32, u32, u32)) -> AttributionWindow {
        AttributionWindow {
            start: NaiveDate::from_ymd_opt(start.0, start.1, start.2).unwrap(),
            end: NaiveDate::from_ymd_opt(end.0, end.1, end.2).unwrap(),
        }
    }

    #[tokio::test]
    async fn json_store_round_trips_totals() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("tally.json");

        let seeded = StoreDocument {
            projects: vec![Project {
                id: "proj1".into(),
                name: "Foo".into(),
                total_seconds: None,
            }],
            posts: vec![Post {
                id: "post1".into(),
                last_post: None,
                created_at: None,
                external_users: None,
                project_ids: vec!["proj1".into()],
                total_seconds: None,
            }],
        };
        std::fs::write(&path, serde_json::to_vec_pretty(&seeded).unwrap()).unwrap();

        let store = JsonStore::open(&path).await.expect("open");
        store
            .set_project_total_seconds("proj1", 3600.0)
            .await
            .expect("project write");
        store
            .set_post_total_seconds("post1", 1800.0)
            .await
            .expect("post write");

        let reloaded = JsonStore::open(&path).await.expect("reopen");
        let projects = reloaded.list_projects().await.expect("list projects");
        assert_eq!(projects[0].total_seconds, Some(3600.0));
        let posts = reloaded.list_posts_for_sync().await.expect("list posts");
        assert_eq!(posts[0].total_seconds, Some(1800.0));
    }

    #[tokio::test]
    async fn json_store_starts_empty_and_rejects_unknown_ids() {
        let dir = tempdir().expect("tempdir");
        let store = JsonStore::open(dir.path().join("fresh.json"))
            .await
            .expect("open");
        assert!(store.list_projects().await.expect("list").is_empty());

        let err = store
            .set_post_total_seconds("missing", 10.0)
            .await
            .expect_err("unknown post");
        assert!(matches!(err, StoreError::UnknownPost(_)));
    }

    #[test]
    fn stats_url_includes_window_and_projects_feature() {
        let client = StatsClient::new(StatsClientConfig {
            base_url: "https://stats.example/api/v1/".into(),
            ..Default::default()
        })
        .expect("client");
        let url = client.stats_url("U123", window((2026, 8, 1), (2026, 8, 14)));
        assert_eq!(
            url,
            "https://stats.example/api/v1/users/U123/stats?features=projects&start_date=2026-08-01&end_date=2026-08-14"
        );
    }

    #[test]
    fn stats_payload_deserializes_project_breakdown() {
        let payload = r#"{
            "data": {
                "projects": [
                    { "name": "foo", "total_seconds": 3600.5, "percent": 80.0 },
                    { "name": "bar", "total_seconds": 120 }
                ]
            }
        }"#;
        let parsed: StatsResponse = serde_json::from_str(payload).expect("parse");
        assert_eq!(parsed.data.projects.len(), 2);
        assert_eq!(parsed.data.projects[0].name, "foo");
        assert_eq!(parsed.data.projects[0].total_seconds, 3600.5);
    }

    #[tokio::test]
    async fn unreachable_host_yields_no_activity() {
        // `.invalid` is reserved and never resolves, so the request fails at
        // the transport layer on the final (only) attempt.
        let client = StatsClient::new(StatsClientConfig {
            base_url: "http://stats.invalid/api/v1".into(),
            api_key: None,
            timeout: Duration::from_secs(5),
            backoff: BackoffPolicy {
                max_retries: 0,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
        })
        .expect("client");

        let got = client
            .fetch_activity("U1", window((2026, 8, 1), (2026, 8, 14)))
            .await;
        assert!(got.is_none());
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
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
    fn retry_classification_covers_rate_limits() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[tokio::test]
    async fn token_bucket_spends_capacity_without_waiting() {
        let bucket = TokenBucket::new(2, Duration::from_secs(60));
        let started = Instant::now();
        bucket.take().await;
        bucket.take().await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn zero_interval_disables_pacing() {
        let bucket = TokenBucket::new(1, Duration::ZERO);
        for _ in 0..10 {
            bucket.take().await;
        }
    }
}
