//! HTTP handlers for webhook ingestion and the read-only stats/control API.
//!
//! Grounded on the teacher's `server.rs` handler shapes (`State<AppState>`
//! extractor, `Result<Json<T>, AuditError>` returns, path/query structs) with
//! the audit-specific bodies replaced by the ones spec.md §6 names.

use std::str::FromStr;

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::db::{self, TaskFilters};
use crate::error::{ReviewError, Result};
use crate::models::{Platform, ReviewTask, Strategy, TaskStatus};
use crate::server::AppState;
use crate::webhook::{self, WebhookOutcome};

pub async fn metrics_text(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.metrics.export_prometheus().await;
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

#[derive(Debug, Serialize)]
struct WebhookResponse {
    status: &'static str,
    task_id: Option<String>,
    reason: Option<String>,
}

pub async fn webhook(
    State(state): State<AppState>,
    Path(platform): Path<String>,
    headers: axum::http::HeaderMap,
    body: axum::body::Bytes,
) -> std::result::Result<Json<WebhookResponse>, ReviewError> {
    let platform = Platform::from_str(&platform)
        .map_err(|_| ReviewError::Validation(format!("unknown platform: {platform}")))?;

    let event_type = headers
        .get("x-review-engine-event")
        .or_else(|| headers.get("x-gitlab-event"))
        .or_else(|| headers.get("x-gitea-event"))
        .or_else(|| headers.get("x-github-event"))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let signature_header = headers
        .get("x-gitlab-token")
        .or_else(|| headers.get("x-gitea-signature"))
        .or_else(|| headers.get("x-hub-signature-256"))
        .and_then(|v| v.to_str().ok());

    let outcome = webhook::ingest(&state.write_pool, platform, &event_type, signature_header, &body).await?;

    let response = match &outcome {
        WebhookOutcome::Created { task_id } => {
            state.scheduler.enqueue(task_id).await?;
            state.metrics.record_webhook_delivery(&platform.to_string(), "created").await;
            WebhookResponse { status: "queued", task_id: Some(task_id.clone()), reason: None }
        }
        WebhookOutcome::Duplicate { task_id } => {
            state.metrics.record_webhook_delivery(&platform.to_string(), "duplicate").await;
            WebhookResponse { status: "duplicate", task_id: Some(task_id.clone()), reason: None }
        }
        WebhookOutcome::Ignored { reason } => {
            state.metrics.record_webhook_delivery(&platform.to_string(), "ignored").await;
            WebhookResponse { status: "ignored", task_id: None, reason: Some(reason.clone()) }
        }
    };

    Ok(Json(response))
}

#[derive(Debug, Serialize)]
struct PollingStatusResponse {
    running: bool,
}

pub async fn polling_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(PollingStatusResponse { running: state.poller.is_running() })
}

pub async fn polling_start(State(state): State<AppState>) -> impl IntoResponse {
    state.poller.start();
    Json(PollingStatusResponse { running: true })
}

pub async fn polling_stop(State(state): State<AppState>) -> impl IntoResponse {
    state.poller.stop();
    Json(PollingStatusResponse { running: false })
}

pub async fn polling_repos(
    State(state): State<AppState>,
) -> std::result::Result<Json<Vec<crate::models::RepoConfig>>, ReviewError> {
    let repos = db::list_repositories(&state.read_pool).await?;
    Ok(Json(repos))
}

#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    pub strategy: Strategy,
    pub revision_ref: Option<String>,
    pub base_ref: Option<String>,
}

#[derive(Debug, Serialize)]
struct TriggerResponse {
    task_id: String,
}

/// Manually enqueue a review. When the caller doesn't supply a revision, the
/// newest commit on the repo's configured branch becomes `revision_ref` and
/// its immediate parent (or the same commit, if it has none) becomes
/// `base_ref` - a manual trigger degenerates to "review the tip of the
/// branch" rather than requiring the caller to know a sha.
pub async fn trigger_review(
    State(state): State<AppState>,
    Path(repo_id): Path<String>,
    Json(request): Json<TriggerRequest>,
) -> std::result::Result<Json<TriggerResponse>, ReviewError> {
    let repo = db::get_repository(&state.read_pool, &repo_id).await?;

    let (revision_ref, base_ref) = match (request.revision_ref, request.base_ref) {
        (Some(revision_ref), Some(base_ref)) => (revision_ref, base_ref),
        (Some(revision_ref), None) => (revision_ref.clone(), revision_ref),
        (revision_ref, _) => resolve_latest_revision(&repo, revision_ref).await?,
    };

    let task = ReviewTask {
        task_id: uuid::Uuid::new_v4().to_string(),
        repo_id: repo.repo_id.clone(),
        strategy: request.strategy,
        revision_ref,
        base_ref,
        branch: repo.branch.clone(),
        author_name: None,
        author_email: None,
        created_at: Utc::now(),
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

    let task_id = db::create_task(&state.write_pool, &task).await?;
    state.scheduler.enqueue(&task_id).await?;
    state.metrics.record_task_created(&task.strategy.to_string()).await;

    Ok(Json(TriggerResponse { task_id }))
}

async fn resolve_latest_revision(
    repo: &crate::models::RepoConfig,
    revision_ref: Option<String>,
) -> Result<(String, String)> {
    if let Some(revision_ref) = revision_ref {
        return Ok((revision_ref.clone(), revision_ref));
    }

    let (project, _) = crate::platform_client::derive_project_coordinates(&repo.clone_url)?;
    let client = crate::platform_client::make_client(repo.platform, &repo.clone_url, repo.auth.clone())?;
    let commits = client.list_commits(&project, &repo.branch, None).await?;

    match commits.last() {
        Some(latest) => {
            let base = commits
                .iter()
                .rev()
                .nth(1)
                .map(|c| c.sha.clone())
                .or_else(|| latest.parent_sha.clone())
                .unwrap_or_else(|| latest.sha.clone());
            Ok((latest.sha.clone(), base))
        }
        None => Err(ReviewError::Validation(format!(
            "repo {} has no commits to review on branch {}",
            repo.repo_id, repo.branch
        ))),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListReviewsQuery {
    pub repo_id: Option<String>,
    pub status: Option<String>,
    pub strategy: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_reviews(
    State(state): State<AppState>,
    Query(query): Query<ListReviewsQuery>,
) -> std::result::Result<Json<Vec<ReviewTask>>, ReviewError> {
    let filters = TaskFilters {
        repo_id: query.repo_id,
        status: query
            .status
            .as_deref()
            .map(TaskStatus::from_str)
            .transpose()
            .map_err(|_| ReviewError::Validation("invalid status filter".to_string()))?,
        strategy: query
            .strategy
            .as_deref()
            .map(Strategy::from_str)
            .transpose()
            .map_err(|_| ReviewError::Validation("invalid strategy filter".to_string()))?,
    };

    let tasks = db::query_tasks(&state.read_pool, &filters, query.limit.unwrap_or(50), query.offset.unwrap_or(0)).await?;
    Ok(Json(tasks))
}

#[derive(Debug, Serialize)]
struct FullTaskResponse {
    #[serde(flatten)]
    task: ReviewTask,
    issues: Vec<crate::models::Issue>,
}

pub async fn review_full(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> std::result::Result<Json<FullTaskResponse>, ReviewError> {
    let task = db::get_full_task(&state.read_pool, &task_id).await?;
    let issues = db::list_issues(&state.read_pool, &task_id).await?;
    Ok(Json(FullTaskResponse { task, issues }))
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    pub format: Option<String>,
}

pub async fn review_export(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Query(query): Query<ExportQuery>,
) -> std::result::Result<Response, ReviewError> {
    let task = db::get_full_task(&state.read_pool, &task_id).await?;
    let issues = db::list_issues(&state.read_pool, &task_id).await?;

    match query.format.as_deref().unwrap_or("md") {
        "md" => Ok(([(header::CONTENT_TYPE, "text/markdown")], render_markdown(&task, &issues)).into_response()),
        "html" => Ok(([(header::CONTENT_TYPE, "text/html")], render_html(&task, &issues)).into_response()),
        other => Err(ReviewError::Validation(format!("unsupported export format: {other}"))),
    }
}

fn render_markdown(task: &ReviewTask, issues: &[crate::models::Issue]) -> String {
    let mut out = format!(
        "# Review {}\n\n- repo: {}\n- strategy: {}\n- revision: {}\n- status: {}\n- quality score: {}\n\n",
        task.task_id, task.repo_id, task.strategy, task.revision_ref, task.status, task.quality_score
    );
    if let Some(verdict) = &task.verdict {
        out.push_str(&format!("**Verdict:** {verdict}\n\n"));
    }
    out.push_str("## Issues\n\n");
    for issue in issues {
        out.push_str(&format!(
            "- **{}** {}{} - {}\n",
            issue.severity,
            issue.file_path.as_deref().unwrap_or("(no file)"),
            issue.line_number.map(|n| format!(":{n}")).unwrap_or_default(),
            issue.title
        ));
    }
    out
}

fn render_html(task: &ReviewTask, issues: &[crate::models::Issue]) -> String {
    let mut out = format!(
        "<h1>Review {}</h1><ul><li>repo: {}</li><li>strategy: {}</li><li>revision: {}</li><li>status: {}</li><li>quality score: {}</li></ul>",
        task.task_id, task.repo_id, task.strategy, task.revision_ref, task.status, task.quality_score
    );
    out.push_str("<h2>Issues</h2><ul>");
    for issue in issues {
        out.push_str(&format!(
            "<li><strong>{}</strong> {}{} - {}</li>",
            issue.severity,
            issue.file_path.as_deref().unwrap_or("(no file)"),
            issue.line_number.map(|n| format!(":{n}")).unwrap_or_default(),
            issue.title
        ));
    }
    out.push_str("</ul>");
    out
}
