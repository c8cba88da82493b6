//! Scheduler / Worker Pool (C9).
//!
//! A bounded pool of `W` worker loops pulling from one `mpsc` channel,
//! generalized from the teacher's `JobQueue`/`IndexJob` status machine in
//! `src/api/jobs.rs` - that queue drives a semaphore-bounded spawn-per-job
//! model; here the channel is the bound instead, so admission is naturally
//! FIFO and concurrency is exactly `W` without a separate permit count to
//! keep in sync.
//!
//! Each worker drives one task end-to-end: checkout, plan, run every batch
//! through the assistant, parse and merge issues, persist the terminal
//! outcome, then best-effort post a comment. Per-task cancellation is a
//! `tokio::sync::watch::Sender<bool>` kept in a `HashMap<TaskId, ..>` so an
//! operator-issued cancel (`db::cancel_task`, then this map) can interrupt a
//! batch already running inside the Assistant Runner.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{error, info, warn};

use crate::assistant_runner::{self, AssistantRunConfig};
use crate::batch_planner::{self, BatchPlanConfig, PlannedFile};
use crate::comment_adapter::{self, CommentAdapterConfig};
use crate::db;
use crate::error::Result;
use crate::models::{BatchResult, BatchStatus, Issue, RepoConfig, RevisionKind, ReviewTask, TaskStatus};
use crate::platform_client;
use crate::report_parser;
use crate::working_copy::WorkingCopyManager;

/// A revision-marker advance tied to the task reviewing that revision - the
/// poller registers one of these when it enqueues a task, and the scheduler
/// only applies it once that exact task finishes `completed`. This is what
/// makes the marker advance "after the task completes" rather than "after
/// the task is merely discovered," per the poller's resumability guarantee.
#[derive(Debug, Clone)]
pub struct PendingMarkerAdvance {
    pub repo_id: String,
    pub branch: String,
    pub kind: RevisionKind,
    pub prev_id: Option<String>,
    pub new_id: String,
    pub new_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of concurrent worker loops pulling from the task channel.
    pub worker_count: usize,
    /// Channel capacity; a full channel applies backpressure to enqueuers
    /// rather than growing an unbounded queue in memory (tasks already
    /// persisted as `pending` survive either way).
    pub channel_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            channel_capacity: 256,
        }
    }
}

type CancellationMap = Arc<Mutex<HashMap<String, watch::Sender<bool>>>>;

pub struct Scheduler {
    pool: sqlx::SqlitePool,
    working_copies: Arc<WorkingCopyManager>,
    assistant_config: AssistantRunConfig,
    batch_config: BatchPlanConfig,
    comment_config: CommentAdapterConfig,
    worker_count: usize,
    sender: mpsc::Sender<String>,
    receiver: Mutex<Option<mpsc::Receiver<String>>>,
    cancellations: CancellationMap,
    pending_marker_advances: Mutex<HashMap<String, PendingMarkerAdvance>>,
}

impl Scheduler {
    pub fn new(
        pool: sqlx::SqlitePool,
        working_copy_base: PathBuf,
        assistant_config: AssistantRunConfig,
        batch_config: BatchPlanConfig,
        comment_config: CommentAdapterConfig,
        config: &SchedulerConfig,
    ) -> Result<Self> {
        let (sender, receiver) = mpsc::channel(config.channel_capacity.max(1));
        Ok(Self {
            pool,
            working_copies: Arc::new(WorkingCopyManager::new(working_copy_base)?),
            assistant_config,
            batch_config,
            comment_config,
            worker_count: config.worker_count.max(1),
            sender,
            receiver: Mutex::new(Some(receiver)),
            cancellations: Arc::new(Mutex::new(HashMap::new())),
            pending_marker_advances: Mutex::new(HashMap::new()),
        })
    }

    /// Register a revision-marker advance to apply once `task_id` finishes
    /// `completed`. Called by the poller right after it creates the task
    /// that reviews the newest commit/MR in a poll batch.
    pub async fn register_marker_advance(&self, task_id: &str, advance: PendingMarkerAdvance) {
        self.pending_marker_advances.lock().await.insert(task_id.to_string(), advance);
    }

    async fn advance_revision_marker_if_due(&self, repo: &RepoConfig, task: &ReviewTask) {
        let Some(advance) = self.pending_marker_advances.lock().await.remove(&task.task_id) else {
            return;
        };

        match db::compare_and_advance(
            &self.pool,
            &advance.repo_id,
            &advance.branch,
            advance.kind,
            advance.prev_id.as_deref(),
            &advance.new_id,
            advance.new_at,
        )
        .await
        {
            Ok(true) => info!(task_id = %task.task_id, repo_id = %repo.repo_id, kind = %advance.kind, "revision marker advanced after task completion"),
            Ok(false) => warn!(task_id = %task.task_id, repo_id = %repo.repo_id, "revision marker changed concurrently, will reconcile next poll"),
            Err(e) => error!(task_id = %task.task_id, repo_id = %repo.repo_id, error = %e, "failed to advance revision marker"),
        }
    }

    /// Enqueue an already-persisted task by id. Called right after
    /// `db::create_task` succeeds, by both the webhook handler and the
    /// poller.
    pub async fn enqueue(&self, task_id: &str) -> Result<()> {
        self.sender
            .send(task_id.to_string())
            .await
            .map_err(|_| crate::error::ReviewError::Internal("scheduler channel closed".to_string()))
    }

    /// Request cancellation of a task that is pending or currently
    /// processing. Flips the DB status and, if a worker already holds a
    /// cancellation handle for it, signals the watch so a running batch is
    /// interrupted mid-flight.
    pub async fn cancel(&self, task_id: &str) -> Result<TaskStatus> {
        let status = db::cancel_task(&self.pool, task_id).await?;
        if let Some(tx) = self.cancellations.lock().await.get(task_id) {
            let _ = tx.send(true);
        }
        Ok(status)
    }

    /// Replay every task left `pending` from a previous run (restart
    /// recovery, §8 scenario), oldest first, then start `worker_count`
    /// worker loops consuming the channel. Runs until the process exits.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let pending = db::list_pending_tasks_for_restart(&self.pool).await?;
        if !pending.is_empty() {
            info!(count = pending.len(), "replaying pending tasks from previous run");
            for task in pending {
                self.enqueue(&task.task_id).await?;
            }
        }

        let receiver = self
            .receiver
            .lock()
            .await
            .take()
            .ok_or_else(|| crate::error::ReviewError::Internal("scheduler already running".to_string()))?;
        let receiver = Arc::new(Mutex::new(receiver));

        let mut handles = Vec::with_capacity(self.worker_count);
        for worker_id in 0..self.worker_count {
            let scheduler = self.clone();
            let receiver = receiver.clone();
            handles.push(tokio::spawn(async move {
                scheduler.worker_loop(worker_id, receiver).await;
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }

        Ok(())
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, receiver: Arc<Mutex<mpsc::Receiver<String>>>) {
        loop {
            let task_id = {
                let mut rx = receiver.lock().await;
                rx.recv().await
            };
            let Some(task_id) = task_id else {
                info!(worker_id, "scheduler channel closed, worker exiting");
                return;
            };

            if let Err(e) = self.process_task(&task_id).await {
                error!(worker_id, task_id, error = %e, "task processing failed unexpectedly");
            }
        }
    }

    async fn process_task(&self, task_id: &str) -> Result<()> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.cancellations.lock().await.insert(task_id.to_string(), cancel_tx);

        let outcome = self.run_task(task_id, &cancel_rx).await;
        self.cancellations.lock().await.remove(task_id);
        outcome
    }

    async fn run_task(&self, task_id: &str, cancel_rx: &watch::Receiver<bool>) -> Result<()> {
        let started = Instant::now();
        let task = db::get_full_task(&self.pool, task_id).await?;

        if task.status.is_terminal() {
            warn!(task_id, status = %task.status, "skipping already-terminal task");
            return Ok(());
        }

        let repo = db::get_repository(&self.pool, &task.repo_id).await?;

        db::mark_processing(&self.pool, task_id).await?;
        info!(task_id, repo_id = %repo.repo_id, revision_ref = %task.revision_ref, "task processing started");

        match self.execute_batches(&repo, &task, cancel_rx).await {
            Ok((issues, files_reviewed, raw_reports, verdict)) => {
                let report = report_parser::concat_reports(&raw_reports);

                // Absent fields default to verdict="reviewed"; a batch run
                // that produced neither issues nor any recognizable issue
                // heading at all gets "unparsed" instead, so a genuinely
                // clean review isn't indistinguishable from a report in a
                // format nothing here could parse.
                let verdict = verdict.or_else(|| {
                    let any_markers = raw_reports
                        .iter()
                        .any(|(_, text)| report_parser::contains_issue_markers(text));
                    if issues.is_empty() && !any_markers {
                        Some("unparsed".to_string())
                    } else {
                        Some("reviewed".to_string())
                    }
                });

                let outcome = db::FinalizeOutcome {
                    status: TaskStatus::Completed,
                    issues,
                    files_reviewed,
                    report: Some(report.clone()),
                    verdict,
                    processing_time_seconds: started.elapsed().as_secs_f64(),
                    fail_reason: None,
                };
                db::finalize(&self.pool, task_id, outcome).await?;
                info!(task_id, "task completed");

                if repo.enable_comment {
                    self.post_comment_best_effort(&repo, &task, &report).await;
                }

                self.advance_revision_marker_if_due(&repo, &task).await;
            }
            Err(e) => {
                let status = if is_cancelled(cancel_rx) {
                    TaskStatus::Cancelled
                } else {
                    TaskStatus::Failed
                };
                warn!(task_id, error = %e, ?status, "task ended without a completed report");
                let outcome = db::FinalizeOutcome {
                    status,
                    issues: Vec::new(),
                    files_reviewed: Vec::new(),
                    report: None,
                    verdict: None,
                    processing_time_seconds: started.elapsed().as_secs_f64(),
                    fail_reason: Some(e.to_string()),
                };
                db::finalize(&self.pool, task_id, outcome).await?;
                // A failed/cancelled task never earns its marker advance;
                // drop the pending entry so the next poll re-discovers and
                // retries the same revision instead of leaking the entry.
                self.pending_marker_advances.lock().await.remove(task_id);
            }
        }

        Ok(())
    }

    async fn execute_batches(
        &self,
        repo: &RepoConfig,
        task: &ReviewTask,
        cancel_rx: &watch::Receiver<bool>,
    ) -> Result<(Vec<Issue>, Vec<String>, Vec<(usize, String)>, Option<String>)> {
        crate::error::retry_with_backoff(|| {
            self.working_copies
                .checkout(&repo.repo_id, &repo.clone_url, &repo.auth, &task.revision_ref)
        })
        .await?;

        let changed = self
            .working_copies
            .list_changed_files(&repo.repo_id, &task.base_ref, &task.revision_ref)
            .await?;

        let mut planned_files = Vec::with_capacity(changed.len());
        for f in &changed {
            let byte_len = self.working_copies.file_byte_len(&repo.repo_id, &f.path).await.unwrap_or(1).max(1);
            planned_files.push(PlannedFile { path: f.path.clone(), byte_len });
        }

        let batches = batch_planner::plan_batches(&planned_files, &self.batch_config);
        db::set_batch_total(&self.pool, &task.task_id, batches.len()).await?;

        let mut all_issues = Vec::new();
        let mut files_reviewed = Vec::new();
        let mut raw_reports = Vec::new();
        let mut verdict = None;
        let mut any_batch_succeeded = false;
        let mut last_error = None;

        for batch in &batches {
            if is_cancelled(cancel_rx) {
                return Err(crate::error::ReviewError::Subprocess("task cancelled before all batches ran".to_string()));
            }

            let prompt = self.build_batch_prompt(repo, task, batch).await?;
            let outcome = assistant_runner::run_batch(
                &self.assistant_config,
                &prompt,
                &[("REVIEW_ENGINE_REPO_ID", repo.repo_id.as_str())],
                Some(&repo.auth),
                Some(cancel_rx.clone()),
            )
            .await;

            let batch_result = match &outcome {
                Ok(o) if o.exit_code == Some(0) => BatchResult {
                    index: batch.index,
                    status: BatchStatus::Success,
                    files: batch.files.clone(),
                    oversize: batch.oversize,
                    error: None,
                },
                Ok(o) => BatchResult {
                    index: batch.index,
                    status: BatchStatus::Failed,
                    files: batch.files.clone(),
                    oversize: batch.oversize,
                    error: Some(format!("assistant exited with code {:?}", o.exit_code)),
                },
                Err(e) => BatchResult {
                    index: batch.index,
                    status: if is_cancelled(cancel_rx) { BatchStatus::Cancelled } else { BatchStatus::Failed },
                    files: batch.files.clone(),
                    oversize: batch.oversize,
                    error: Some(e.to_string()),
                },
            };
            db::update_progress(&self.pool, &task.task_id, &batch_result).await?;

            match outcome {
                Ok(o) if o.exit_code == Some(0) => {
                    any_batch_succeeded = true;
                    let issues = report_parser::parse_batch_report(&task.task_id, &o.stdout);
                    all_issues.extend(issues);
                    if let Some(v) = report_parser::parse_verdict(&o.stdout) {
                        verdict = Some(v);
                    }
                    raw_reports.push((batch.index, o.stdout));
                    files_reviewed.extend(batch.files.clone());
                }
                Ok(o) => {
                    warn!(task_id = %task.task_id, batch = batch.index, exit_code = ?o.exit_code, "batch failed, continuing with remaining batches");
                    raw_reports.push((batch.index, o.stdout));
                    last_error = Some(crate::error::ReviewError::Subprocess(format!(
                        "batch {} exited with code {:?}: {}",
                        batch.index, o.exit_code, o.stderr
                    )));
                }
                Err(e) => {
                    warn!(task_id = %task.task_id, batch = batch.index, error = %e, "batch errored, continuing with remaining batches");
                    last_error = Some(e);
                }
            }
        }

        if !any_batch_succeeded {
            return Err(last_error
                .unwrap_or_else(|| crate::error::ReviewError::Subprocess("no batches ran".to_string())));
        }

        Ok((report_parser::merge_issues(all_issues), files_reviewed, raw_reports, verdict))
    }

    /// Render the batch's file contents plus a minimal whole-repo context
    /// map into the prompt piped to the assistant's stdin.
    async fn build_batch_prompt(
        &self,
        repo: &RepoConfig,
        task: &ReviewTask,
        batch: &batch_planner::PlannedBatch,
    ) -> Result<String> {
        let mut prompt = format!(
            "Repository: {}\nRevision: {}\nBase: {}\nBatch {} of files:\n\n",
            repo.name, task.revision_ref, task.base_ref, batch.index
        );

        for path in &batch.files {
            match self.working_copies.read_file(&repo.repo_id, path).await {
                Ok(contents) => {
                    prompt.push_str(&format!("--- {path} ---\n{contents}\n\n"));
                }
                Err(e) => {
                    warn!(repo_id = %repo.repo_id, path, error = %e, "could not read file for batch, skipping its content");
                }
            }
        }

        Ok(prompt)
    }

    async fn post_comment_best_effort(&self, repo: &RepoConfig, task: &ReviewTask, report: &str) {
        let coordinates = platform_client::derive_project_coordinates(&repo.clone_url);
        let (base_url, project) = match coordinates {
            Ok(c) => c,
            Err(e) => {
                warn!(task_id = %task.task_id, error = %e, "could not derive project coordinates, skipping comment");
                return;
            }
        };

        let client = match platform_client::make_client(repo.platform, &base_url, repo.auth.clone()) {
            Ok(c) => c,
            Err(e) => {
                warn!(task_id = %task.task_id, error = %e, "could not build platform client, skipping comment");
                return;
            }
        };

        comment_adapter::post_report(
            client.as_ref(),
            &project,
            &task.revision_ref,
            &task.task_id,
            report,
            &self.comment_config,
        )
        .await;
    }
}

fn is_cancelled(rx: &watch::Receiver<bool>) -> bool {
    *rx.borrow()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_then_cancel_marks_task_cancelled() {
        let pool = db::init_db("sqlite::memory:").await.unwrap();
        let repo = RepoConfig {
            repo_id: "r1".to_string(),
            name: "demo".to_string(),
            clone_url: "https://git.example.com/team/repo.git".to_string(),
            branch: "main".to_string(),
            platform: crate::models::Platform::Gitea,
            auth: crate::models::RepoAuth::None,
            trigger_mode: crate::models::TriggerMode::Webhook,
            polling_interval_minutes: 10,
            effective_from: chrono::Utc::now(),
            poll_commits: true,
            poll_mrs: false,
            enable_comment: false,
            enabled: true,
            local_path: None,
            clone_status: crate::models::CloneStatus::Absent,
            last_check_time: None,
            webhook_secret: None,
        };
        db::add_repository(&pool, &repo).await.unwrap();

        let task = ReviewTask {
            task_id: "t1".to_string(),
            repo_id: "r1".to_string(),
            strategy: crate::models::Strategy::Commit,
            revision_ref: "deadbeef".to_string(),
            base_ref: "cafebabe".to_string(),
            branch: "main".to_string(),
            author_name: None,
            author_email: None,
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
        db::create_task(&pool, &task).await.unwrap();

        let dir = tempfile::TempDir::new().unwrap();
        let scheduler = Scheduler::new(
            pool.clone(),
            dir.path().to_path_buf(),
            AssistantRunConfig::default(),
            BatchPlanConfig::default(),
            CommentAdapterConfig::default(),
            &SchedulerConfig::default(),
        )
        .unwrap();

        let status = scheduler.cancel("t1").await.unwrap();
        assert_eq!(status, TaskStatus::Cancelled);

        let stored = db::get_full_task(&pool, "t1").await.unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);
    }
}
