//! Ingestion - Poller (C8).
//!
//! A single ticker loop directly grounded on the teacher's `AutoScanner`:
//! `start`/`scan_enabled_repos`/`check_and_scan_repo` becomes
//! `run`/`poll_enabled_repos`/`poll_repo` here, with the `auto_scan_enabled`
//! DB filter replaced by `trigger_mode.accepts_polling()` and git-diff-based
//! change detection replaced by listing commits/MRs from the platform API
//! since the stored revision marker. Repos that are still being polled from
//! the previous tick are skipped rather than queued, the same
//! skip-if-still-running rule `AutoScanner` doesn't need (its own loop is
//! serial) but this poller does, since ticks run repos concurrently.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, error, info, warn};

use crate::db;
use crate::models::{MrEvent, PlatformEvent, PushEvent, RepoConfig, RevisionKind, TaskStatus};
use crate::platform_client;
use crate::scheduler::Scheduler;

#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// How often the ticker wakes up to check which repos are due.
    pub tick_interval: Duration,
    /// Upper bound on repos polled concurrently within one tick.
    pub max_concurrent_polls: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            max_concurrent_polls: 2,
        }
    }
}

pub struct Poller {
    pool: sqlx::SqlitePool,
    scheduler: Arc<Scheduler>,
    config: PollerConfig,
    in_flight: Arc<RwLock<HashSet<String>>>,
    /// Controlled by `POST /polling/start|stop` - the ticker keeps running
    /// while this is true but skips its tick body while false.
    running: AtomicBool,
}

impl Poller {
    pub fn new(pool: sqlx::SqlitePool, scheduler: Arc<Scheduler>, config: PollerConfig) -> Self {
        Self {
            pool,
            scheduler,
            config,
            in_flight: Arc::new(RwLock::new(HashSet::new())),
            running: AtomicBool::new(true),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Runs forever. Intended to be `tokio::spawn`ed once at startup.
    pub async fn run(self: Arc<Self>) {
        info!(
            interval_secs = self.config.tick_interval.as_secs(),
            "starting ingestion poller"
        );
        loop {
            if self.is_running() {
                if let Err(e) = self.poll_enabled_repos().await {
                    error!(error = %e, "poll cycle failed");
                }
            } else {
                debug!("poller is stopped, skipping tick");
            }
            tokio::time::sleep(self.config.tick_interval).await;
        }
    }

    async fn poll_enabled_repos(&self) -> crate::error::Result<()> {
        let repos = db::list_enabled_repositories(&self.pool).await?;
        let due: Vec<RepoConfig> = repos
            .into_iter()
            .filter(|r| r.trigger_mode.accepts_polling())
            .filter(|r| is_due(r))
            .collect();

        if due.is_empty() {
            debug!("no repositories due for polling");
            return Ok(());
        }

        info!(count = due.len(), "polling due repositories");
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_polls.max(1)));
        let mut handles = Vec::new();

        for repo in due {
            let repo_id = repo.repo_id.clone();
            {
                let mut in_flight = self.in_flight.write().await;
                if !in_flight.insert(repo_id.clone()) {
                    debug!(repo_id, "skipping repo, previous poll still running");
                    continue;
                }
            }

            let pool = self.pool.clone();
            let scheduler = self.scheduler.clone();
            let semaphore = semaphore.clone();
            let in_flight = self.in_flight.clone();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.ok();
                if let Err(e) = poll_repo(&pool, &scheduler, &repo).await {
                    error!(repo_id = %repo.repo_id, error = %e, "failed to poll repository");
                }
                in_flight.write().await.remove(&repo_id);
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }

        Ok(())
    }
}

fn is_due(repo: &RepoConfig) -> bool {
    let Some(last_check) = repo.last_check_time else {
        return true;
    };
    let interval = chrono::Duration::minutes(repo.polling_interval_minutes.max(1));
    chrono::Utc::now() - last_check >= interval
}

/// Poll one repo for new commits (on its configured branch) and open merge
/// requests, converting each newly-seen one into a `PlatformEvent` and
/// routing it through the same decode-free ingest path the webhook uses -
/// the poller never re-implements task creation or the at-most-one rule.
async fn poll_repo(
    pool: &sqlx::SqlitePool,
    scheduler: &Scheduler,
    repo: &RepoConfig,
) -> crate::error::Result<()> {
    let (base_url, project) = platform_client::derive_project_coordinates(&repo.clone_url)?;
    let client = platform_client::make_client(repo.platform, &base_url, repo.auth.clone())?;

    if repo.poll_commits {
        if let Err(e) = poll_commits(pool, scheduler, repo, client.as_ref(), &project).await {
            warn!(repo_id = %repo.repo_id, error = %e, "commit polling failed");
        }
    }

    if repo.poll_mrs {
        if let Err(e) = poll_merge_requests(pool, scheduler, repo, client.as_ref(), &project).await {
            warn!(repo_id = %repo.repo_id, error = %e, "merge request polling failed");
        }
    }

    db::update_last_check_time(pool, &repo.repo_id).await?;
    Ok(())
}

async fn poll_commits(
    pool: &sqlx::SqlitePool,
    scheduler: &Scheduler,
    repo: &RepoConfig,
    client: &dyn platform_client::PlatformClient,
    project: &str,
) -> crate::error::Result<()> {
    let marker = db::get_revision_marker(pool, &repo.repo_id, &repo.branch, RevisionKind::Commit).await?;
    let since = marker.last_seen_at;

    let commits = crate::error::retry_with_backoff(|| client.list_commits(project, &repo.branch, since)).await?;
    let commits: Vec<_> = commits.into_iter().filter(|c| c.committed_at >= repo.effective_from).collect();
    if commits.is_empty() {
        return Ok(());
    }

    let last_sha = commits.last().map(|c| c.sha.clone());
    let mut last_task_id = None;

    for commit in &commits {
        let event = PlatformEvent::Push(PushEvent {
            clone_url_hint: repo.clone_url.clone(),
            branch: repo.branch.clone(),
            revision_ref: commit.sha.clone(),
            base_ref: commit.parent_sha.clone().unwrap_or_default(),
            author_name: commit.author_name.clone(),
            author_email: commit.author_email.clone(),
            event_time: commit.committed_at,
        });

        let task_id = enqueue_from_event(pool, scheduler, repo, event).await?;
        if Some(&commit.sha) == last_sha.as_ref() {
            last_task_id = task_id;
        }
    }

    // The marker only advances once the task reviewing the newest commit in
    // this batch actually completes - registered here, applied by the
    // scheduler's finalize path, never eagerly at discovery time.
    if let (Some(task_id), Some(sha)) = (last_task_id, last_sha) {
        let commit_at = commits.last().map(|c| c.committed_at).unwrap_or_else(chrono::Utc::now);
        scheduler
            .register_marker_advance(
                &task_id,
                crate::scheduler::PendingMarkerAdvance {
                    repo_id: repo.repo_id.clone(),
                    branch: repo.branch.clone(),
                    kind: RevisionKind::Commit,
                    prev_id: marker.last_seen_id.clone(),
                    new_id: sha,
                    new_at: commit_at,
                },
            )
            .await;
    }

    Ok(())
}

async fn poll_merge_requests(
    pool: &sqlx::SqlitePool,
    scheduler: &Scheduler,
    repo: &RepoConfig,
    client: &dyn platform_client::PlatformClient,
    project: &str,
) -> crate::error::Result<()> {
    let marker = db::get_revision_marker(pool, &repo.repo_id, &repo.branch, RevisionKind::Mr).await?;

    let mrs = crate::error::retry_with_backoff(|| client.list_merge_requests(project, &repo.branch)).await?;
    let mut newest: Option<(String, chrono::DateTime<chrono::Utc>, String)> = None;

    for mr in &mrs {
        if let Some(last_seen) = marker.last_seen_at {
            if mr.updated_at <= last_seen {
                continue;
            }
        }
        if mr.updated_at < repo.effective_from {
            continue;
        }

        let event = PlatformEvent::MergeRequest(MrEvent {
            clone_url_hint: repo.clone_url.clone(),
            branch: mr.target_branch.clone(),
            revision_ref: mr.head_sha.clone(),
            base_ref: mr.base_sha.clone(),
            author_name: mr.author_name.clone(),
            author_email: None,
            event_time: mr.updated_at,
        });

        let task_id = enqueue_from_event(pool, scheduler, repo, event).await?;

        if newest.as_ref().map(|(_, t, _)| mr.updated_at > *t).unwrap_or(true) {
            if let Some(task_id) = task_id {
                newest = Some((mr.id.clone(), mr.updated_at, task_id));
            }
        }
    }

    // Same deferred-advance rule as commits: only the task reviewing the
    // most-recently-updated MR in this batch carries the marker forward,
    // and only once it completes.
    if let Some((id, updated_at, task_id)) = newest {
        scheduler
            .register_marker_advance(
                &task_id,
                crate::scheduler::PendingMarkerAdvance {
                    repo_id: repo.repo_id.clone(),
                    branch: repo.branch.clone(),
                    kind: RevisionKind::Mr,
                    prev_id: marker.last_seen_id.clone(),
                    new_id: id,
                    new_at: updated_at,
                },
            )
            .await;
    }

    Ok(())
}

/// Convert a platform event discovered by polling into a task the same way
/// `webhook::ingest` would, without re-verifying a signature (the event came
/// from an authenticated API call the engine itself made) or re-resolving
/// the repo (already known).
async fn enqueue_from_event(
    pool: &sqlx::SqlitePool,
    scheduler: &Scheduler,
    repo: &RepoConfig,
    event: PlatformEvent,
) -> crate::error::Result<Option<String>> {
    let Some(normalized) = event.normalize() else {
        return Ok(None);
    };

    let task = crate::models::ReviewTask {
        task_id: uuid::Uuid::new_v4().to_string(),
        repo_id: repo.repo_id.clone(),
        strategy: normalized.strategy,
        revision_ref: normalized.revision_ref.clone(),
        base_ref: normalized.base_ref.clone(),
        branch: normalized.branch.clone(),
        author_name: normalized.author_name.clone(),
        author_email: normalized.author_email.clone(),
        created_at: chrono::Utc::now(),
        started_at: None,
        finished_at: None,
        status: TaskStatus::Pending,
        batch_total: 0,
        batch_current: 0,
        batch_results: Vec::new(),
        issues_count: 0,
        critical_count: 0,
        warning_count: 0,
        suggestion_count: 0,
        quality_score: 0,
        files_reviewed: Vec::new(),
        report: None,
        processing_time_seconds: None,
        verdict: None,
        risk_level: None,
        fail_reason: None,
    };

    match db::create_task(pool, &task).await {
        Ok(task_id) => {
            info!(repo_id = %repo.repo_id, task_id, "poller created task");
            scheduler.enqueue(&task_id).await?;
            Ok(Some(task_id))
        }
        Err(db::DbError::Conflict(existing)) => {
            debug!(repo_id = %repo.repo_id, existing, "poller found an already-pending task, skipping");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CloneStatus, Platform, RepoAuth, TriggerMode};

    fn repo(last_check: Option<chrono::DateTime<chrono::Utc>>, interval_minutes: i64) -> RepoConfig {
        RepoConfig {
            repo_id: "r1".to_string(),
            name: "demo".to_string(),
            clone_url: "https://git.example.com/team/repo.git".to_string(),
            branch: "main".to_string(),
            platform: Platform::Gitea,
            auth: RepoAuth::None,
            trigger_mode: TriggerMode::Polling,
            polling_interval_minutes: interval_minutes,
            effective_from: chrono::Utc::now(),
            poll_commits: true,
            poll_mrs: false,
            enable_comment: false,
            enabled: true,
            local_path: None,
            clone_status: CloneStatus::Absent,
            last_check_time: last_check,
            webhook_secret: None,
        }
    }

    #[test]
    fn never_checked_repo_is_due() {
        assert!(is_due(&repo(None, 30)));
    }

    #[test]
    fn recently_checked_repo_is_not_due() {
        let repo = repo(Some(chrono::Utc::now()), 30);
        assert!(!is_due(&repo));
    }

    #[test]
    fn repo_past_its_interval_is_due() {
        let last_check = chrono::Utc::now() - chrono::Duration::minutes(31);
        let repo = repo(Some(last_check), 30);
        assert!(is_due(&repo));
    }
}
