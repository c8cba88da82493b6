//! Core persistence for the Review Orchestration Engine.
//!
//! SQLite via `sqlx`, one pool capped at a single connection so that every
//! statement against `repos`/`tasks`/`issues`/`revision_markers`/`settings`
//! is naturally serialized through that one connection (§5: "a single
//! connection serialized by an internal mutex"). Table creation follows the
//! teacher's `CREATE TABLE IF NOT EXISTS` + additive `ALTER TABLE` migration
//! style (`src/db/core.rs::create_tables`).

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqlitePoolOptions, FromRow, Row, SqlitePool};
use std::str::FromStr;
use thiserror::Error;

use crate::models::{
    BatchResult, BatchStatus, CloneStatus, Issue, Platform, RepoConfig,
    RevisionKind, RevisionMarker, ReviewTask, RiskLevel, Severity, Strategy, TaskStatus,
    TriggerMode,
};

#[derive(Error, Debug)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("schema migration error: {0}")]
    Migration(String),
}

pub type DbResult<T> = Result<T, DbError>;

const CURRENT_SCHEMA_VERSION: i64 = 1;

/// Initialize the database: create the file if missing, open a
/// single-connection pool, run migrations, recover tasks orphaned by a
/// prior crash (§4.2: `processing` → `failed`, reason `"aborted by restart"`).
pub async fn init_db(database_url: &str) -> DbResult<SqlitePool> {
    if let Some(path) = database_url.strip_prefix("sqlite:") {
        let file_path = std::path::Path::new(path);
        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        if !file_path.exists() {
            std::fs::File::create(file_path).ok();
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(database_url)
        .await?;

    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

    create_tables(&pool).await?;
    run_migrations(&pool).await?;
    recover_aborted_tasks(&pool).await?;

    Ok(pool)
}

/// Open a second, multi-connection pool against the same database file for
/// read-only queries (§5: "single-writer, multi-reader"). Callers that only
/// ever `fetch`/`fetch_all` - the HTTP read endpoints in `api`, mainly -
/// should use this pool instead of the single-connection write pool so a
/// burst of dashboard queries can't queue behind an in-flight task write.
/// Schema must already exist, so this is only ever called after `init_db`.
pub async fn init_read_pool(database_url: &str) -> DbResult<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;
    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
    Ok(pool)
}

async fn create_tables(pool: &SqlitePool) -> DbResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS repos (
            repo_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            clone_url TEXT NOT NULL,
            branch TEXT NOT NULL,
            platform TEXT NOT NULL,
            auth_json TEXT NOT NULL DEFAULT '{"kind":"none"}',
            trigger_mode TEXT NOT NULL DEFAULT 'polling',
            polling_interval_minutes INTEGER NOT NULL DEFAULT 15,
            effective_from INTEGER NOT NULL DEFAULT 0,
            poll_commits INTEGER NOT NULL DEFAULT 1,
            poll_mrs INTEGER NOT NULL DEFAULT 0,
            enable_comment INTEGER NOT NULL DEFAULT 0,
            enabled INTEGER NOT NULL DEFAULT 1,
            local_path TEXT,
            clone_status TEXT NOT NULL DEFAULT 'absent',
            last_check_time INTEGER,
            webhook_secret TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS revision_markers (
            repo_id TEXT NOT NULL,
            branch TEXT NOT NULL,
            kind TEXT NOT NULL,
            last_seen_id TEXT,
            last_seen_at INTEGER,
            PRIMARY KEY (repo_id, branch, kind)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            task_id TEXT PRIMARY KEY,
            repo_id TEXT NOT NULL,
            strategy TEXT NOT NULL,
            revision_ref TEXT NOT NULL,
            base_ref TEXT NOT NULL,
            branch TEXT NOT NULL,
            author_name TEXT,
            author_email TEXT,
            created_at INTEGER NOT NULL,
            started_at INTEGER,
            finished_at INTEGER,
            status TEXT NOT NULL DEFAULT 'pending',
            batch_total INTEGER NOT NULL DEFAULT 0,
            batch_current INTEGER NOT NULL DEFAULT 0,
            batch_results_json TEXT NOT NULL DEFAULT '[]',
            issues_count INTEGER NOT NULL DEFAULT 0,
            critical_count INTEGER NOT NULL DEFAULT 0,
            warning_count INTEGER NOT NULL DEFAULT 0,
            suggestion_count INTEGER NOT NULL DEFAULT 0,
            quality_score INTEGER,
            files_reviewed_json TEXT NOT NULL DEFAULT '[]',
            report TEXT,
            processing_time_seconds REAL,
            verdict TEXT,
            risk_level TEXT,
            fail_reason TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS issues (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            severity TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            file_path TEXT,
            line_number INTEGER,
            code_snippet TEXT,
            suggestion TEXT,
            category TEXT,
            FOREIGN KEY (task_id) REFERENCES tasks(task_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_repo_strategy_rev ON tasks(repo_id, strategy, revision_ref)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_created ON tasks(created_at)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_issues_task ON issues(task_id, seq)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Forward schema migrations, gated on the `meta.schema_version` row. There
/// is one schema generation today; this exists so a future column/table
/// addition has somewhere to go without a hand rollout.
async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    let current: Option<(String,)> = sqlx::query_as("SELECT value FROM meta WHERE key = 'schema_version'")
        .fetch_optional(pool)
        .await?;

    let version: i64 = match current {
        Some((v,)) => v.parse().map_err(|_| {
            DbError::Migration(format!("unparseable schema_version value: {v}"))
        })?,
        None => {
            sqlx::query("INSERT INTO meta (key, value) VALUES ('schema_version', ?)")
                .bind(CURRENT_SCHEMA_VERSION.to_string())
                .execute(pool)
                .await?;
            CURRENT_SCHEMA_VERSION
        }
    };

    if version > CURRENT_SCHEMA_VERSION {
        return Err(DbError::Migration(format!(
            "database schema_version {version} is newer than this binary supports ({CURRENT_SCHEMA_VERSION})"
        )));
    }

    // No migration steps exist yet between version 1 and CURRENT_SCHEMA_VERSION.
    if version < CURRENT_SCHEMA_VERSION {
        sqlx::query("UPDATE meta SET value = ? WHERE key = 'schema_version'")
            .bind(CURRENT_SCHEMA_VERSION.to_string())
            .execute(pool)
            .await?;
    }

    Ok(())
}

/// Any task left `processing` across a restart did not finish its batches
/// and cannot be resumed (§4.2); mark it failed rather than silently drop it.
async fn recover_aborted_tasks(pool: &SqlitePool) -> DbResult<()> {
    let now = Utc::now().timestamp();
    let result = sqlx::query(
        "UPDATE tasks SET status = 'failed', fail_reason = 'aborted by restart', finished_at = ? \
         WHERE status = 'processing'",
    )
    .bind(now)
    .execute(pool)
    .await?;

    if result.rows_affected() > 0 {
        tracing::warn!(
            count = result.rows_affected(),
            "recovered tasks left processing across restart"
        );
    }

    Ok(())
}

fn ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

fn from_ts(v: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(v, 0).single().unwrap_or_else(Utc::now)
}

// ============================================================================
// Repository configuration (consumed by C3/C4/C7/C8)
// ============================================================================

#[derive(FromRow)]
struct RepoRow {
    repo_id: String,
    name: String,
    clone_url: String,
    branch: String,
    platform: String,
    auth_json: String,
    trigger_mode: String,
    polling_interval_minutes: i64,
    effective_from: i64,
    poll_commits: i64,
    poll_mrs: i64,
    enable_comment: i64,
    enabled: i64,
    local_path: Option<String>,
    clone_status: String,
    last_check_time: Option<i64>,
    webhook_secret: Option<String>,
}

impl RepoRow {
    fn into_config(self) -> DbResult<RepoConfig> {
        Ok(RepoConfig {
            repo_id: self.repo_id,
            name: self.name,
            clone_url: self.clone_url,
            branch: self.branch,
            platform: Platform::from_str(&self.platform)
                .map_err(|e| DbError::InvalidInput(e.to_string()))?,
            auth: serde_json::from_str(&self.auth_json)
                .map_err(|e| DbError::InvalidInput(format!("auth_json: {e}")))?,
            trigger_mode: parse_trigger_mode(&self.trigger_mode)?,
            polling_interval_minutes: self.polling_interval_minutes,
            effective_from: from_ts(self.effective_from),
            poll_commits: self.poll_commits != 0,
            poll_mrs: self.poll_mrs != 0,
            enable_comment: self.enable_comment != 0,
            enabled: self.enabled != 0,
            local_path: self.local_path,
            clone_status: CloneStatus::from_str(&self.clone_status)
                .map_err(|e| DbError::InvalidInput(e.to_string()))?,
            last_check_time: self.last_check_time.map(from_ts),
            webhook_secret: self.webhook_secret,
        })
    }
}

fn parse_trigger_mode(s: &str) -> DbResult<TriggerMode> {
    match s {
        "webhook" => Ok(TriggerMode::Webhook),
        "polling" => Ok(TriggerMode::Polling),
        "both" => Ok(TriggerMode::Both),
        other => Err(DbError::InvalidInput(format!("unknown trigger_mode: {other}"))),
    }
}

fn trigger_mode_str(m: TriggerMode) -> &'static str {
    match m {
        TriggerMode::Webhook => "webhook",
        TriggerMode::Polling => "polling",
        TriggerMode::Both => "both",
    }
}

pub async fn add_repository(pool: &SqlitePool, cfg: &RepoConfig) -> DbResult<()> {
    let now = Utc::now().timestamp();
    let auth_json = serde_json::to_string(&cfg.auth)
        .map_err(|e| DbError::InvalidInput(format!("auth serialize: {e}")))?;

    sqlx::query(
        r#"
        INSERT INTO repos
        (repo_id, name, clone_url, branch, platform, auth_json, trigger_mode,
         polling_interval_minutes, effective_from, poll_commits, poll_mrs,
         enable_comment, enabled, local_path, clone_status, last_check_time,
         webhook_secret, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&cfg.repo_id)
    .bind(&cfg.name)
    .bind(&cfg.clone_url)
    .bind(&cfg.branch)
    .bind(cfg.platform.to_string())
    .bind(auth_json)
    .bind(trigger_mode_str(cfg.trigger_mode))
    .bind(cfg.polling_interval_minutes)
    .bind(ts(cfg.effective_from))
    .bind(cfg.poll_commits as i64)
    .bind(cfg.poll_mrs as i64)
    .bind(cfg.enable_comment as i64)
    .bind(cfg.enabled as i64)
    .bind(&cfg.local_path)
    .bind(cfg.clone_status.to_string())
    .bind(cfg.last_check_time.map(ts))
    .bind(&cfg.webhook_secret)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_repository(pool: &SqlitePool, repo_id: &str) -> DbResult<RepoConfig> {
    let row: RepoRow = sqlx::query_as("SELECT * FROM repos WHERE repo_id = ?")
        .bind(repo_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("repo {repo_id}")))?;
    row.into_config()
}

pub async fn list_repositories(pool: &SqlitePool) -> DbResult<Vec<RepoConfig>> {
    let rows: Vec<RepoRow> = sqlx::query_as("SELECT * FROM repos ORDER BY name")
        .fetch_all(pool)
        .await?;
    rows.into_iter().map(RepoRow::into_config).collect()
}

pub async fn list_enabled_repositories(pool: &SqlitePool) -> DbResult<Vec<RepoConfig>> {
    let rows: Vec<RepoRow> = sqlx::query_as("SELECT * FROM repos WHERE enabled = 1 ORDER BY name")
        .fetch_all(pool)
        .await?;
    rows.into_iter().map(RepoRow::into_config).collect()
}

pub async fn find_repository_by_clone_url(
    pool: &SqlitePool,
    normalized_url: &str,
) -> DbResult<Option<RepoConfig>> {
    let repos = list_enabled_repositories(pool).await?;
    Ok(repos
        .into_iter()
        .find(|r| crate::models::normalize_clone_url(&r.clone_url) == normalized_url))
}

pub async fn update_clone_status(
    pool: &SqlitePool,
    repo_id: &str,
    status: CloneStatus,
    local_path: Option<&str>,
) -> DbResult<()> {
    let now = Utc::now().timestamp();
    sqlx::query(
        "UPDATE repos SET clone_status = ?, local_path = COALESCE(?, local_path), updated_at = ? WHERE repo_id = ?",
    )
    .bind(status.to_string())
    .bind(local_path)
    .bind(now)
    .bind(repo_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn update_last_check_time(pool: &SqlitePool, repo_id: &str) -> DbResult<()> {
    let now = Utc::now().timestamp();
    sqlx::query("UPDATE repos SET last_check_time = ?, updated_at = ? WHERE repo_id = ?")
        .bind(now)
        .bind(now)
        .bind(repo_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn remove_repository(pool: &SqlitePool, repo_id: &str) -> DbResult<()> {
    sqlx::query("DELETE FROM repos WHERE repo_id = ?")
        .bind(repo_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ============================================================================
// Revision markers (C1)
// ============================================================================

pub async fn get_revision_marker(
    pool: &SqlitePool,
    repo_id: &str,
    branch: &str,
    kind: RevisionKind,
) -> DbResult<RevisionMarker> {
    let row: Option<(Option<String>, Option<i64>)> = sqlx::query_as(
        "SELECT last_seen_id, last_seen_at FROM revision_markers WHERE repo_id = ? AND branch = ? AND kind = ?",
    )
    .bind(repo_id)
    .bind(branch)
    .bind(kind.to_string())
    .fetch_optional(pool)
    .await?;

    let (last_seen_id, last_seen_at) = row.unwrap_or((None, None));
    Ok(RevisionMarker {
        repo_id: repo_id.to_string(),
        branch: branch.to_string(),
        kind,
        last_seen_id,
        last_seen_at: last_seen_at.map(from_ts),
    })
}

/// Compare-and-swap advance: rejected (returns `Ok(false)`) if `expected_prev`
/// does not match the currently stored value. `None` means "no marker yet".
pub async fn compare_and_advance(
    pool: &SqlitePool,
    repo_id: &str,
    branch: &str,
    kind: RevisionKind,
    expected_prev: Option<&str>,
    new_id: &str,
    new_at: DateTime<Utc>,
) -> DbResult<bool> {
    let existing = get_revision_marker(pool, repo_id, branch, kind).await?;
    if existing.last_seen_id.as_deref() != expected_prev {
        return Ok(false);
    }

    sqlx::query(
        r#"
        INSERT INTO revision_markers (repo_id, branch, kind, last_seen_id, last_seen_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(repo_id, branch, kind) DO UPDATE SET
            last_seen_id = excluded.last_seen_id,
            last_seen_at = excluded.last_seen_at
        "#,
    )
    .bind(repo_id)
    .bind(branch)
    .bind(kind.to_string())
    .bind(new_id)
    .bind(ts(new_at))
    .execute(pool)
    .await?;

    Ok(true)
}

pub async fn reset_revision_marker(
    pool: &SqlitePool,
    repo_id: &str,
    branch: &str,
    kind: RevisionKind,
) -> DbResult<()> {
    sqlx::query("DELETE FROM revision_markers WHERE repo_id = ? AND branch = ? AND kind = ?")
        .bind(repo_id)
        .bind(branch)
        .bind(kind.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

// ============================================================================
// Review tasks (C2)
// ============================================================================

#[derive(FromRow)]
struct TaskRow {
    task_id: String,
    repo_id: String,
    strategy: String,
    revision_ref: String,
    base_ref: String,
    branch: String,
    author_name: Option<String>,
    author_email: Option<String>,
    created_at: i64,
    started_at: Option<i64>,
    finished_at: Option<i64>,
    status: String,
    batch_total: i64,
    batch_current: i64,
    batch_results_json: String,
    issues_count: i64,
    critical_count: i64,
    warning_count: i64,
    suggestion_count: i64,
    quality_score: Option<i64>,
    files_reviewed_json: String,
    report: Option<String>,
    processing_time_seconds: Option<f64>,
    verdict: Option<String>,
    risk_level: Option<String>,
    fail_reason: Option<String>,
}

impl TaskRow {
    fn into_task(self) -> DbResult<ReviewTask> {
        Ok(ReviewTask {
            task_id: self.task_id,
            repo_id: self.repo_id,
            strategy: Strategy::from_str(&self.strategy)
                .map_err(|e| DbError::InvalidInput(e.to_string()))?,
            revision_ref: self.revision_ref,
            base_ref: self.base_ref,
            branch: self.branch,
            author_name: self.author_name,
            author_email: self.author_email,
            created_at: from_ts(self.created_at),
            started_at: self.started_at.map(from_ts),
            finished_at: self.finished_at.map(from_ts),
            status: TaskStatus::from_str(&self.status)
                .map_err(|e| DbError::InvalidInput(e.to_string()))?,
            batch_total: self.batch_total as usize,
            batch_current: self.batch_current as usize,
            batch_results: serde_json::from_str(&self.batch_results_json)
                .map_err(|e| DbError::InvalidInput(format!("batch_results_json: {e}")))?,
            issues_count: self.issues_count,
            critical_count: self.critical_count,
            warning_count: self.warning_count,
            suggestion_count: self.suggestion_count,
            quality_score: self.quality_score.unwrap_or(0),
            files_reviewed: serde_json::from_str(&self.files_reviewed_json)
                .map_err(|e| DbError::InvalidInput(format!("files_reviewed_json: {e}")))?,
            report: self.report,
            processing_time_seconds: self.processing_time_seconds,
            verdict: self.verdict,
            risk_level: self
                .risk_level
                .as_deref()
                .map(parse_risk_level)
                .transpose()?,
            fail_reason: self.fail_reason,
        })
    }
}

fn parse_risk_level(s: &str) -> DbResult<RiskLevel> {
    match s {
        "low" => Ok(RiskLevel::Low),
        "medium" => Ok(RiskLevel::Medium),
        "high" => Ok(RiskLevel::High),
        other => Err(DbError::InvalidInput(format!("unknown risk_level: {other}"))),
    }
}

/// Create a new task, enforcing the at-most-one-non-terminal rule for
/// `(repo_id, strategy, revision_ref)` (§4.2, §8 testable property).
pub async fn create_task(pool: &SqlitePool, task: &ReviewTask) -> DbResult<String> {
    let existing: Option<(String,)> = sqlx::query_as(
        r#"
        SELECT task_id FROM tasks
        WHERE repo_id = ? AND strategy = ? AND revision_ref = ?
          AND status IN ('pending', 'processing')
        "#,
    )
    .bind(&task.repo_id)
    .bind(task.strategy.to_string())
    .bind(&task.revision_ref)
    .fetch_optional(pool)
    .await?;

    if let Some((existing_id,)) = existing {
        return Err(DbError::Conflict(existing_id));
    }

    sqlx::query(
        r#"
        INSERT INTO tasks
        (task_id, repo_id, strategy, revision_ref, base_ref, branch,
         author_name, author_email, created_at, status, batch_total,
         batch_current, batch_results_json, issues_count, critical_count,
         warning_count, suggestion_count, files_reviewed_json)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', 0, 0, '[]', 0, 0, 0, 0, '[]')
        "#,
    )
    .bind(&task.task_id)
    .bind(&task.repo_id)
    .bind(task.strategy.to_string())
    .bind(&task.revision_ref)
    .bind(&task.base_ref)
    .bind(&task.branch)
    .bind(&task.author_name)
    .bind(&task.author_email)
    .bind(ts(task.created_at))
    .execute(pool)
    .await?;

    Ok(task.task_id.clone())
}

pub async fn get_full_task(pool: &SqlitePool, task_id: &str) -> DbResult<ReviewTask> {
    let row: TaskRow = sqlx::query_as("SELECT * FROM tasks WHERE task_id = ?")
        .bind(task_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("task {task_id}")))?;
    row.into_task()
}

pub async fn mark_processing(pool: &SqlitePool, task_id: &str) -> DbResult<()> {
    let now = Utc::now().timestamp();
    sqlx::query("UPDATE tasks SET status = 'processing', started_at = ? WHERE task_id = ? AND status = 'pending'")
        .bind(now)
        .bind(task_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_batch_total(pool: &SqlitePool, task_id: &str, batch_total: usize) -> DbResult<()> {
    sqlx::query("UPDATE tasks SET batch_total = ? WHERE task_id = ?")
        .bind(batch_total as i64)
        .bind(task_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Record the outcome of one batch and advance `batch_current`. Batches are
/// recorded strictly in plan order (§5 ordering guarantee).
pub async fn update_progress(
    pool: &SqlitePool,
    task_id: &str,
    batch_result: &BatchResult,
) -> DbResult<()> {
    let mut task = get_full_task(pool, task_id).await?;
    if let Some(slot) = task.batch_results.iter_mut().find(|b| b.index == batch_result.index) {
        *slot = batch_result.clone();
    } else {
        task.batch_results.push(batch_result.clone());
    }
    task.batch_results.sort_by_key(|b| b.index);
    let batch_current = task
        .batch_results
        .iter()
        .take_while(|b| !matches!(b.status, BatchStatus::Pending))
        .count();

    let results_json = serde_json::to_string(&task.batch_results)
        .map_err(|e| DbError::InvalidInput(format!("batch_results serialize: {e}")))?;

    sqlx::query("UPDATE tasks SET batch_current = ?, batch_results_json = ? WHERE task_id = ?")
        .bind(batch_current as i64)
        .bind(results_json)
        .bind(task_id)
        .execute(pool)
        .await?;

    Ok(())
}

pub struct FinalizeOutcome {
    pub status: TaskStatus,
    pub issues: Vec<Issue>,
    pub files_reviewed: Vec<String>,
    pub report: Option<String>,
    pub verdict: Option<String>,
    pub processing_time_seconds: f64,
    pub fail_reason: Option<String>,
}

/// Persist the terminal outcome of a task: issues, summary fields, and the
/// concatenated report. Terminal statuses are write-once - this function is
/// only ever called once per task by the scheduler.
pub async fn finalize(pool: &SqlitePool, task_id: &str, outcome: FinalizeOutcome) -> DbResult<()> {
    let critical = outcome
        .issues
        .iter()
        .filter(|i| i.severity == Severity::Critical)
        .count() as i64;
    let warning = outcome
        .issues
        .iter()
        .filter(|i| i.severity == Severity::Warning)
        .count() as i64;
    let suggestion = outcome
        .issues
        .iter()
        .filter(|i| i.severity == Severity::Suggestion)
        .count() as i64;

    let quality_score = ReviewTask::compute_quality_score(critical, warning, suggestion);
    let risk_level = ReviewTask::compute_risk_level(critical, warning);
    let now = Utc::now().timestamp();
    let files_json = serde_json::to_string(&outcome.files_reviewed)
        .map_err(|e| DbError::InvalidInput(format!("files_reviewed serialize: {e}")))?;

    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        UPDATE tasks SET
            status = ?, finished_at = ?, issues_count = ?, critical_count = ?,
            warning_count = ?, suggestion_count = ?, quality_score = ?,
            files_reviewed_json = ?, report = ?, processing_time_seconds = ?,
            verdict = ?, risk_level = ?, fail_reason = ?
        WHERE task_id = ?
        "#,
    )
    .bind(outcome.status.to_string())
    .bind(now)
    .bind(outcome.issues.len() as i64)
    .bind(critical)
    .bind(warning)
    .bind(suggestion)
    .bind(quality_score)
    .bind(files_json)
    .bind(&outcome.report)
    .bind(outcome.processing_time_seconds)
    .bind(&outcome.verdict)
    .bind(risk_level.to_string())
    .bind(&outcome.fail_reason)
    .bind(task_id)
    .execute(&mut *tx)
    .await?;

    for (seq, issue) in outcome.issues.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO issues
            (id, task_id, seq, severity, title, description, file_path,
             line_number, code_snippet, suggestion, category)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&issue.id)
        .bind(task_id)
        .bind(seq as i64)
        .bind(issue.severity.to_string())
        .bind(&issue.title)
        .bind(&issue.description)
        .bind(&issue.file_path)
        .bind(issue.line_number)
        .bind(&issue.code_snippet)
        .bind(&issue.suggestion)
        .bind(&issue.category)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

pub async fn list_issues(pool: &SqlitePool, task_id: &str) -> DbResult<Vec<Issue>> {
    let rows = sqlx::query(
        "SELECT id, severity, title, description, file_path, line_number, code_snippet, \
         suggestion, category FROM issues WHERE task_id = ? ORDER BY seq",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            Ok(Issue {
                id: row.try_get("id")?,
                task_id: task_id.to_string(),
                severity: Severity::from_str(row.try_get::<String, _>("severity")?.as_str())
                    .map_err(|e| DbError::InvalidInput(e.to_string()))?,
                title: row.try_get("title")?,
                description: row.try_get("description")?,
                file_path: row.try_get("file_path")?,
                line_number: row.try_get("line_number")?,
                code_snippet: row.try_get("code_snippet")?,
                suggestion: row.try_get("suggestion")?,
                category: row.try_get("category")?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()
        .map_err(DbError::Sqlx)
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilters {
    pub repo_id: Option<String>,
    pub status: Option<TaskStatus>,
    pub strategy: Option<Strategy>,
}

pub async fn query_tasks(
    pool: &SqlitePool,
    filters: &TaskFilters,
    limit: i64,
    offset: i64,
) -> DbResult<Vec<ReviewTask>> {
    let mut sql = String::from("SELECT * FROM tasks WHERE 1=1");
    if filters.repo_id.is_some() {
        sql.push_str(" AND repo_id = ?");
    }
    if filters.status.is_some() {
        sql.push_str(" AND status = ?");
    }
    if filters.strategy.is_some() {
        sql.push_str(" AND strategy = ?");
    }
    sql.push_str(" ORDER BY created_at DESC LIMIT ? OFFSET ?");

    let mut query = sqlx::query_as::<_, TaskRow>(&sql);
    if let Some(repo_id) = &filters.repo_id {
        query = query.bind(repo_id);
    }
    if let Some(status) = filters.status {
        query = query.bind(status.to_string());
    }
    if let Some(strategy) = filters.strategy {
        query = query.bind(strategy.to_string());
    }
    query = query.bind(limit).bind(offset);

    let rows = query.fetch_all(pool).await?;
    rows.into_iter().map(TaskRow::into_task).collect()
}

pub async fn list_pending_tasks_for_restart(pool: &SqlitePool) -> DbResult<Vec<ReviewTask>> {
    let rows: Vec<TaskRow> =
        sqlx::query_as("SELECT * FROM tasks WHERE status = 'pending' ORDER BY created_at ASC")
            .fetch_all(pool)
            .await?;
    rows.into_iter().map(TaskRow::into_task).collect()
}

pub async fn delete_task(pool: &SqlitePool, task_id: &str) -> DbResult<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM issues WHERE task_id = ?")
        .bind(task_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM tasks WHERE task_id = ?")
        .bind(task_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// Cancel a task from its current status. Returns the resulting status so
/// the scheduler can decide whether a live subprocess must be killed.
pub async fn cancel_task(pool: &SqlitePool, task_id: &str) -> DbResult<TaskStatus> {
    let task = get_full_task(pool, task_id).await?;
    if task.status.is_terminal() {
        return Ok(task.status);
    }

    let now = Utc::now().timestamp();
    sqlx::query("UPDATE tasks SET status = 'cancelled', finished_at = ? WHERE task_id = ?")
        .bind(now)
        .bind(task_id)
        .execute(pool)
        .await?;

    Ok(TaskStatus::Cancelled)
}

// ============================================================================
// Settings store (Design Note §9)
// ============================================================================

pub async fn get_setting(pool: &SqlitePool, key: &str) -> DbResult<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(v,)| v))
}

pub async fn set_setting(pool: &SqlitePool, key: &str, value: &str) -> DbResult<()> {
    let now = Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
    )
    .bind(key)
    .bind(value)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_settings(pool: &SqlitePool) -> DbResult<Vec<(String, String)>> {
    let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM settings")
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbStats {
    pub total_tasks: i64,
    pub completed_tasks: i64,
    pub failed_tasks: i64,
    pub total_repos: i64,
}

pub async fn get_stats(pool: &SqlitePool) -> DbResult<DbStats> {
    let total_tasks: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks")
        .fetch_one(pool)
        .await?;
    let completed_tasks: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE status = 'completed'")
            .fetch_one(pool)
            .await?;
    let failed_tasks: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE status = 'failed'")
        .fetch_one(pool)
        .await?;
    let total_repos: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM repos")
        .fetch_one(pool)
        .await?;

    Ok(DbStats {
        total_tasks: total_tasks.0,
        completed_tasks: completed_tasks.0,
        failed_tasks: failed_tasks.0,
        total_repos: total_repos.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RepoAuth;

    async fn test_pool() -> SqlitePool {
        init_db("sqlite::memory:").await.unwrap()
    }

    fn sample_repo(repo_id: &str) -> RepoConfig {
        RepoConfig {
            repo_id: repo_id.to_string(),
            name: "demo".to_string(),
            clone_url: "https://git.example.com/demo.git".to_string(),
            branch: "main".to_string(),
            platform: Platform::Gitlab,
            auth: RepoAuth::None,
            trigger_mode: TriggerMode::Both,
            polling_interval_minutes: 5,
            effective_from: Utc::now(),
            poll_commits: true,
            poll_mrs: true,
            enable_comment: false,
            enabled: true,
            local_path: None,
            clone_status: CloneStatus::Absent,
            last_check_time: None,
            webhook_secret: Some("s3cr3t".to_string()),
        }
    }

    fn sample_task(repo_id: &str, revision: &str) -> ReviewTask {
        ReviewTask {
            task_id: uuid::Uuid::new_v4().to_string(),
            repo_id: repo_id.to_string(),
            strategy: Strategy::Commit,
            revision_ref: revision.to_string(),
            base_ref: "base".to_string(),
            branch: "main".to_string(),
            author_name: None,
            author_email: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            status: TaskStatus::Pending,
            batch_total: 0,
            batch_current: 0,
            batch_results: vec![],
            issues_count: 0,
            critical_count: 0,
            warning_count: 0,
            suggestion_count: 0,
            quality_score: 0,
            files_reviewed: vec![],
            report: None,
            processing_time_seconds: None,
            verdict: None,
            risk_level: None,
            fail_reason: None,
        }
    }

    #[tokio::test]
    async fn repository_round_trip() {
        let pool = test_pool().await;
        add_repository(&pool, &sample_repo("r1")).await.unwrap();
        let loaded = get_repository(&pool, "r1").await.unwrap();
        assert_eq!(loaded.name, "demo");
        assert_eq!(loaded.webhook_secret.as_deref(), Some("s3cr3t"));
    }

    #[tokio::test]
    async fn at_most_one_non_terminal_task() {
        let pool = test_pool().await;
        add_repository(&pool, &sample_repo("r1")).await.unwrap();
        let t1 = sample_task("r1", "abc123");
        create_task(&pool, &t1).await.unwrap();

        let t2 = sample_task("r1", "abc123");
        let err = create_task(&pool, &t2).await.unwrap_err();
        assert!(matches!(err, DbError::Conflict(_)));
    }

    #[tokio::test]
    async fn at_most_one_allows_new_task_after_terminal() {
        let pool = test_pool().await;
        add_repository(&pool, &sample_repo("r1")).await.unwrap();
        let t1 = sample_task("r1", "abc123");
        create_task(&pool, &t1).await.unwrap();
        mark_processing(&pool, &t1.task_id).await.unwrap();
        finalize(
            &pool,
            &t1.task_id,
            FinalizeOutcome {
                status: TaskStatus::Completed,
                issues: vec![],
                files_reviewed: vec![],
                report: Some("ok".to_string()),
                verdict: Some("reviewed".to_string()),
                processing_time_seconds: 1.0,
                fail_reason: None,
            },
        )
        .await
        .unwrap();

        let t2 = sample_task("r1", "abc123");
        create_task(&pool, &t2).await.unwrap();
    }

    #[tokio::test]
    async fn revision_marker_compare_and_swap() {
        let pool = test_pool().await;
        add_repository(&pool, &sample_repo("r1")).await.unwrap();

        let ok = compare_and_advance(&pool, "r1", "main", RevisionKind::Commit, None, "sha1", Utc::now())
            .await
            .unwrap();
        assert!(ok);

        let rejected = compare_and_advance(
            &pool,
            "r1",
            "main",
            RevisionKind::Commit,
            None,
            "sha2",
            Utc::now(),
        )
        .await
        .unwrap();
        assert!(!rejected);

        let ok2 = compare_and_advance(
            &pool,
            "r1",
            "main",
            RevisionKind::Commit,
            Some("sha1"),
            "sha2",
            Utc::now(),
        )
        .await
        .unwrap();
        assert!(ok2);

        let marker = get_revision_marker(&pool, "r1", "main", RevisionKind::Commit)
            .await
            .unwrap();
        assert_eq!(marker.last_seen_id.as_deref(), Some("sha2"));
    }

    #[tokio::test]
    async fn restart_recovery_marks_processing_as_failed() {
        let pool = test_pool().await;
        add_repository(&pool, &sample_repo("r1")).await.unwrap();
        let t1 = sample_task("r1", "abc123");
        create_task(&pool, &t1).await.unwrap();
        mark_processing(&pool, &t1.task_id).await.unwrap();

        recover_aborted_tasks(&pool).await.unwrap();

        let reloaded = get_full_task(&pool, &t1.task_id).await.unwrap();
        assert_eq!(reloaded.status, TaskStatus::Failed);
        assert_eq!(reloaded.fail_reason.as_deref(), Some("aborted by restart"));
    }

    #[tokio::test]
    async fn finalize_computes_quality_score_from_issues() {
        let pool = test_pool().await;
        add_repository(&pool, &sample_repo("r1")).await.unwrap();
        let t1 = sample_task("r1", "abc123");
        create_task(&pool, &t1).await.unwrap();
        mark_processing(&pool, &t1.task_id).await.unwrap();

        let issues = vec![Issue {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: t1.task_id.clone(),
            severity: Severity::Warning,
            title: "x".to_string(),
            description: "y".to_string(),
            file_path: None,
            line_number: None,
            code_snippet: None,
            suggestion: None,
            category: None,
        }];

        finalize(
            &pool,
            &t1.task_id,
            FinalizeOutcome {
                status: TaskStatus::Completed,
                issues,
                files_reviewed: vec!["a.rs".to_string()],
                report: Some("report text".to_string()),
                verdict: Some("reviewed".to_string()),
                processing_time_seconds: 2.5,
                fail_reason: None,
            },
        )
        .await
        .unwrap();

        let reloaded = get_full_task(&pool, &t1.task_id).await.unwrap();
        assert_eq!(reloaded.quality_score, 97);
        assert_eq!(reloaded.issues_count, 1);
        assert_eq!(reloaded.warning_count, 1);

        let issues = list_issues(&pool, &t1.task_id).await.unwrap();
        assert_eq!(issues.len(), 1);
    }
}
