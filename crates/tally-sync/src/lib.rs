//! Time-attribution sync engine: matches externally tracked coding time
//! against internal posts and aggregates it per project.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;

use tally_core::{normalize_name, AttributionWindow, Project};
use tally_storage::{
    ActivitySource, BackoffPolicy, JsonStore, PostStore, ProjectStore, StatsClient,
    StatsClientConfig, TokenBucket,
};

pub const CRATE_NAME: &str = "tally-sync";

/// Fires at :00 and :30 every hour, on the wall clock.
pub const SYNC_CRON: &str = "0 0,30 * * * *";
/// Once-per-minute informational tick reporting time until the next run.
const TICK_CRON: &str = "0 * * * * *";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub stats_base_url: String,
    pub stats_api_key: Option<String>,
    pub http_timeout_secs: u64,
    pub sync_concurrency: usize,
    pub write_pause_ms: u64,
    pub data_file: PathBuf,
    pub scheduler_enabled: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            stats_base_url: "https://hackatime.hackclub.com/api/v1".to_string(),
            stats_api_key: None,
            http_timeout_secs: 20,
            sync_concurrency: 2,
            write_pause_ms: 500,
            data_file: PathBuf::from("./tally.json"),
            scheduler_enabled: false,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            stats_base_url: std::env::var("TALLY_STATS_BASE_URL")
                .unwrap_or(defaults.stats_base_url),
            stats_api_key: std::env::var("TALLY_STATS_API_KEY").ok(),
            http_timeout_secs: std::env::var("TALLY_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            sync_concurrency: std::env::var("TALLY_SYNC_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.sync_concurrency),
            write_pause_ms: std::env::var("TALLY_WRITE_PAUSE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.write_pause_ms),
            data_file: std::env::var("TALLY_DATA_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_file),
            scheduler_enabled: std::env::var("TALLY_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
        }
    }
}

/// A project as seen through the resolver: id plus display name.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedProject {
    pub id: String,
    pub name: String,
}

/// Per-run lookup from project ids and normalized names to projects.
///
/// Rebuilt from the project snapshot at the start of every run; never
/// updated incrementally. Normalized-name equality is the only matching
/// rule applied to external activity entries.
#[derive(Debug, Default)]
pub struct NameResolver {
    display_by_id: HashMap<String, String>,
    project_by_norm: HashMap<String, ResolvedProject>,
}

impl NameResolver {
    pub fn build(projects: &[Project]) -> Self {
        let mut display_by_id = HashMap::new();
        let mut project_by_norm = HashMap::new();
        for project in projects {
            display_by_id.insert(project.id.clone(), project.name.clone());
            project_by_norm.insert(
                normalize_name(&project.name),
                ResolvedProject {
                    id: project.id.clone(),
                    name: project.name.clone(),
                },
            );
        }
        Self {
            display_by_id,
            project_by_norm,
        }
    }

    pub fn display_name(&self, id: &str) -> Option<&str> {
        self.display_by_id.get(id).map(String::as_str)
    }

    pub fn by_normalized(&self, normalized: &str) -> Option<&ResolvedProject> {
        self.project_by_norm.get(normalized)
    }
}

/// Runs attribution tasks with a fixed concurrency ceiling.
///
/// `spawn` never blocks the caller. `wait_idle` resolves once every spawned
/// task has finished, including tasks spawned while earlier ones were still
/// running. A task that panics still counts as finished, so one bad post
/// can never wedge the run.
#[derive(Debug, Clone)]
pub struct BoundedQueue {
    inner: Arc<QueueInner>,
}

#[derive(Debug)]
struct QueueInner {
    limit: Arc<Semaphore>,
    pending: AtomicUsize,
    idle: Notify,
}

struct CompletionGuard {
    inner: Arc<QueueInner>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if self.inner.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

impl BoundedQueue {
    pub fn new(concurrency: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                limit: Arc::new(Semaphore::new(concurrency.max(1))),
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            // Dropped on completion or unwind, either way the pending count
            // reaches wait_idle.
            let _done = CompletionGuard {
                inner: inner.clone(),
            };
            let _permit = inner
                .limit
                .clone()
                .acquire_owned()
                .await
                .expect("queue semaphore never closed");
            task.await;
        });
    }

    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Run-scoped max tracker keyed by (project id, external user id).
///
/// Offers are max-replace, so updates commute: concurrent tasks touching the
/// same pair converge on the largest value regardless of completion order.
/// The accumulator is dropped at the end of each run, never merged across
/// runs.
#[derive(Debug, Default)]
pub struct MaxAccumulator {
    entries: Mutex<HashMap<String, HashMap<String, f64>>>,
}

impl MaxAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `seconds` for the pair unless a larger value is already held.
    pub async fn offer(&self, project_id: &str, user_id: &str, seconds: f64) {
        let mut entries = self.entries.lock().await;
        let per_user = entries.entry(project_id.to_string()).or_default();
        match per_user.get_mut(user_id) {
            Some(existing) if *existing >= seconds => {}
            Some(existing) => *existing = seconds,
            None => {
                per_user.insert(user_id.to_string(), seconds);
            }
        }
    }

    pub async fn get(&self, project_id: &str, user_id: &str) -> Option<f64> {
        self.entries
            .lock()
            .await
            .get(project_id)
            .and_then(|users| users.get(user_id))
            .copied()
    }

    /// Sums the per-user maxima into one total per project.
    pub async fn project_totals(&self) -> Vec<(String, f64)> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|(id, users)| (id.clone(), users.values().sum()))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub posts_seen: usize,
    pub posts_skipped: usize,
    pub posts_synced: usize,
    pub projects_synced: usize,
    pub fetch_failures: usize,
}

pub struct SyncEngine {
    posts: Arc<dyn PostStore>,
    projects: Arc<dyn ProjectStore>,
    activity: Arc<dyn ActivitySource>,
    concurrency: usize,
    write_pacer: TokenBucket,
}

impl SyncEngine {
    pub fn new(
        posts: Arc<dyn PostStore>,
        projects: Arc<dyn ProjectStore>,
        activity: Arc<dyn ActivitySource>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            posts,
            projects,
            activity,
            concurrency: config.sync_concurrency.max(1),
            write_pacer: TokenBucket::new(1, Duration::from_millis(config.write_pause_ms)),
        }
    }

    /// Wires the engine against the JSON store and the live stats endpoint.
    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let store = Arc::new(
            JsonStore::open(&config.data_file)
                .await
                .with_context(|| format!("opening store {}", config.data_file.display()))?,
        );
        let client = StatsClient::new(StatsClientConfig {
            base_url: config.stats_base_url.clone(),
            api_key: config.stats_api_key.clone(),
            timeout: Duration::from_secs(config.http_timeout_secs),
            backoff: BackoffPolicy::default(),
        })
        .context("building stats client")?;
        Ok(Self::new(
            store.clone(),
            store,
            Arc::new(client),
            config,
        ))
    }

    /// One full attribution run over the current post and project sets.
    ///
    /// Only run-setup failures (listing projects or posts) escape as errors.
    /// Everything per-post, per-user, or per-write is logged and contained.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, "starting attribution sync run");

        let projects = self
            .projects
            .list_projects()
            .await
            .context("listing projects")?;
        let resolver = Arc::new(NameResolver::build(&projects));
        let posts = self
            .posts
            .list_posts_for_sync()
            .await
            .context("listing posts for sync")?;

        let accumulator = Arc::new(MaxAccumulator::new());
        let post_totals: Arc<Mutex<HashMap<String, f64>>> = Arc::new(Mutex::new(HashMap::new()));
        let fetch_failures = Arc::new(AtomicUsize::new(0));
        let queue = BoundedQueue::new(self.concurrency);

        let posts_seen = posts.len();
        let mut posts_skipped = 0usize;

        for post in posts {
            let Some(window) = post.attribution_window() else {
                debug!(post = %post.id, "skipping post without a complete attribution window");
                posts_skipped += 1;
                continue;
            };
            let users = post.external_user_ids();
            if users.is_empty() {
                debug!(post = %post.id, "skipping post with no external users");
                posts_skipped += 1;
                continue;
            }
            let declared: Vec<ResolvedProject> = post
                .project_ids
                .iter()
                .filter_map(|id| {
                    resolver.display_name(id).map(|name| ResolvedProject {
                        id: id.clone(),
                        name: name.to_string(),
                    })
                })
                .collect();
            if declared.is_empty() {
                debug!(post = %post.id, "skipping post with no resolvable projects");
                posts_skipped += 1;
                continue;
            }

            let task = AttributionTask {
                post_id: post.id.clone(),
                users,
                declared,
                window,
                activity: self.activity.clone(),
                resolver: resolver.clone(),
                accumulator: accumulator.clone(),
                post_totals: post_totals.clone(),
                fetch_failures: fetch_failures.clone(),
            };
            queue.spawn(task.run());
        }

        queue.wait_idle().await;

        let totals = post_totals.lock().await.clone();
        let mut posts_synced = 0usize;
        for (post_id, total) in &totals {
            if *total <= 0.0 {
                continue;
            }
            match self.posts.set_post_total_seconds(post_id, *total).await {
                Ok(()) => {
                    info!(post = %post_id, seconds = total, "updated post total");
                    posts_synced += 1;
                }
                Err(err) => warn!(post = %post_id, error = %err, "failed to update post total"),
            }
            self.write_pacer.take().await;
        }

        let mut projects_synced = 0usize;
        for (project_id, total) in accumulator.project_totals().await {
            if total <= 0.0 {
                continue;
            }
            match self
                .projects
                .set_project_total_seconds(&project_id, total)
                .await
            {
                Ok(()) => {
                    info!(project = %project_id, seconds = total, "updated project total");
                    projects_synced += 1;
                }
                Err(err) => {
                    warn!(project = %project_id, error = %err, "failed to update project total")
                }
            }
            self.write_pacer.take().await;
        }

        let finished_at = Utc::now();
        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            posts_seen,
            posts_skipped,
            posts_synced,
            projects_synced,
            fetch_failures: fetch_failures.load(Ordering::Acquire),
        };
        info!(
            %run_id,
            posts_seen = summary.posts_seen,
            posts_skipped = summary.posts_skipped,
            posts_synced = summary.posts_synced,
            projects_synced = summary.projects_synced,
            fetch_failures = summary.fetch_failures,
            "attribution sync run finished"
        );
        Ok(summary)
    }

    /// Boolean wrapper for operator-facing callers: `false` only when the
    /// run failed outside the per-item containment boundaries.
    pub async fn run_sync(&self) -> bool {
        match self.run_once().await {
            Ok(_) => true,
            Err(err) => {
                warn!(error = ?err, "attribution sync run failed");
                false
            }
        }
    }
}

struct AttributionTask {
    post_id: String,
    users: Vec<String>,
    declared: Vec<ResolvedProject>,
    window: AttributionWindow,
    activity: Arc<dyn ActivitySource>,
    resolver: Arc<NameResolver>,
    accumulator: Arc<MaxAccumulator>,
    post_totals: Arc<Mutex<HashMap<String, f64>>>,
    fetch_failures: Arc<AtomicUsize>,
}

impl AttributionTask {
    async fn run(self) {
        // Users are processed one after another so accumulator updates and
        // log output stay deterministic within a post.
        for user in &self.users {
            let Some(activity) = self.activity.fetch_activity(user, self.window).await else {
                self.fetch_failures.fetch_add(1, Ordering::AcqRel);
                debug!(post = %self.post_id, user = %user, "no activity for user; skipping");
                continue;
            };

            for entry in &activity.projects {
                let normalized = normalize_name(&entry.name);
                let matched = self
                    .declared
                    .iter()
                    .find(|p| normalize_name(&p.name) == normalized)
                    .cloned()
                    // The fallback consults every known project, not just the
                    // ones declared on the post, so an entry can credit a
                    // project the post never listed. Recorded totals depend
                    // on this.
                    .or_else(|| self.resolver.by_normalized(&normalized).cloned());

                let Some(project) = matched else {
                    debug!(
                        post = %self.post_id,
                        user = %user,
                        entry = %entry.name,
                        "activity entry matched no known project"
                    );
                    continue;
                };

                let mut totals = self.post_totals.lock().await;
                *totals.entry(self.post_id.clone()).or_insert(0.0) += entry.total_seconds;
                drop(totals);

                self.accumulator
                    .offer(&project.id, user, entry.total_seconds)
                    .await;
            }
        }
    }
}

/// The next wall-clock instant that is a multiple of 30 minutes past the
/// hour and strictly after `now` (seconds and sub-seconds zeroed).
pub fn compute_next_run_time(now: DateTime<Utc>) -> DateTime<Utc> {
    let top_of_hour = now
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .expect("zeroing minutes and seconds is always a valid time");
    let slots = i64::from(now.minute() / 30) + 1;
    let next = top_of_hour + ChronoDuration::minutes(30 * slots);
    if next > now {
        next
    } else {
        next + ChronoDuration::minutes(30)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RunState {
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}

/// Drives recurring sync runs on half-hour wall-clock boundaries.
///
/// All state lives on the struct; there are no process-wide globals. Both
/// timestamps stay `None` until `start` has armed the schedule.
pub struct SyncScheduler {
    engine: Arc<SyncEngine>,
    state: Arc<Mutex<RunState>>,
    handle: Mutex<Option<JobScheduler>>,
}

impl SyncScheduler {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self {
            engine,
            state: Arc::new(Mutex::new(RunState::default())),
            handle: Mutex::new(None),
        }
    }

    /// Arms the half-hour sync job plus the minute status tick. Any
    /// previously armed schedule is shut down first, so calling `start`
    /// twice never produces duplicate concurrent runs. A failure to arm is
    /// fatal and propagated.
    pub async fn start(&self) -> Result<()> {
        self.stop().await;

        let sched = JobScheduler::new().await.context("creating job scheduler")?;

        let engine = self.engine.clone();
        let state = self.state.clone();
        let sync_job = Job::new_async(SYNC_CRON, move |_id, _handle| {
            let engine = engine.clone();
            let state = state.clone();
            Box::pin(async move {
                let ok = engine.run_sync().await;
                if !ok {
                    warn!("scheduled sync run reported failure; schedule stays armed");
                }
                let now = Utc::now();
                let mut state = state.lock().await;
                state.last_run = Some(now);
                state.next_run = Some(compute_next_run_time(now));
            })
        })
        .context("creating sync job")?;
        sched.add(sync_job).await.context("adding sync job")?;

        let state = self.state.clone();
        let tick_job = Job::new_async(TICK_CRON, move |_id, _handle| {
            let state = state.clone();
            Box::pin(async move {
                if let Some(next) = state.lock().await.next_run {
                    let remaining = next - Utc::now();
                    debug!(
                        seconds = remaining.num_seconds(),
                        "time until next scheduled sync"
                    );
                }
            })
        })
        .context("creating status tick job")?;
        sched.add(tick_job).await.context("adding status tick job")?;

        sched.start().await.context("starting job scheduler")?;

        let next = compute_next_run_time(Utc::now());
        self.state.lock().await.next_run = Some(next);
        *self.handle.lock().await = Some(sched);
        info!(next_run = %next, "sync schedule armed");
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(mut sched) = self.handle.lock().await.take() {
            if let Err(err) = sched.shutdown().await {
                warn!(error = %err, "failed to shut down previous schedule");
            }
        }
    }

    /// Runs a sync immediately, out of band from the schedule.
    pub async fn trigger_manual(&self) -> bool {
        let ok = self.engine.run_sync().await;
        self.state.lock().await.last_run = Some(Utc::now());
        ok
    }

    pub async fn status(&self) -> RunState {
        *self.state.lock().await
    }

    pub async fn next_run_time(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.next_run
    }

    pub async fn last_run_time(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.last_run
    }
}
