//! Ingestion - Webhook (C7).
//!
//! Decodes a platform's push/merge-request payload into a [`PlatformEvent`],
//! verifies its signature, and hands a normalized event to the Task Store.
//! Signature verification reuses the teacher's HMAC-SHA256 shape from
//! `webhooks.rs::compute_signature`/`verify_signature`, generalized from one
//! fixed scheme to the three schemes real forges actually use: GitLab
//! compares a plain shared token, Gitea and GitHub both HMAC the raw body but
//! disagree on the header name and the `sha256=` prefix.
//!
//! This module only contains the transport-independent decode/verify/ingest
//! logic; the axum route itself lives in `server` so this stays unit
//! testable without spinning up an HTTP server.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

use crate::db;
use crate::error::{ReviewError, Result};
use crate::models::{
    normalize_clone_url, MrEvent, Platform, PlatformEvent, PushEvent, ReviewTask, Strategy,
    TaskStatus,
};

type HmacSha256 = Hmac<Sha256>;

/// Parse a timestamp out of a webhook payload field, falling back to "now"
/// only when the field is absent or malformed - at which point the
/// `effective_from` comparison in `ingest` degrades to "always recent"
/// rather than silently failing closed.
fn parse_event_time(raw: Option<&str>) -> chrono::DateTime<chrono::Utc> {
    match raw.map(chrono::DateTime::parse_from_rfc3339) {
        Some(Ok(dt)) => dt.with_timezone(&chrono::Utc),
        Some(Err(e)) => {
            warn!(raw, error = %e, "could not parse webhook event timestamp, using now");
            chrono::Utc::now()
        }
        None => chrono::Utc::now(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// A new task was created for this event.
    Created { task_id: String },
    /// A non-terminal task already existed for this `(repo, strategy, revision)`.
    Duplicate { task_id: String },
    /// The event was authentic but didn't map to reviewable work (unknown
    /// event type, repo not configured for webhooks, or no matching repo).
    Ignored { reason: String },
}

fn compute_hmac_hex(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts a key of any size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time byte comparison so a timing side-channel can't narrow down
/// a correct secret one byte at a time.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Verify a webhook's authenticity against the repo's configured secret.
/// A repo with no configured secret accepts unsigned deliveries - operators
/// who skip secret configuration have opted out of verification, the same
/// tradeoff the teacher's `WebhookConfig::enable_signatures` flag expresses.
pub fn verify_signature(
    platform: Platform,
    secret: Option<&str>,
    header_value: Option<&str>,
    body: &[u8],
) -> bool {
    let Some(secret) = secret else {
        return true;
    };
    let Some(header_value) = header_value else {
        return false;
    };

    match platform {
        Platform::Gitlab => constant_time_eq(header_value, secret),
        Platform::Gitea => constant_time_eq(header_value, &compute_hmac_hex(secret, body)),
        Platform::Github => {
            let Some(digest) = header_value.strip_prefix("sha256=") else {
                return false;
            };
            constant_time_eq(digest, &compute_hmac_hex(secret, body))
        }
    }
}

fn parse_json(body: &[u8]) -> Result<serde_json::Value> {
    serde_json::from_slice(body).map_err(|e| ReviewError::Validation(format!("invalid JSON body: {e}")))
}

fn str_field<'a>(v: &'a serde_json::Value, path: &[&str]) -> Option<&'a str> {
    let mut cur = v;
    for key in path {
        cur = cur.get(key)?;
    }
    cur.as_str()
}

/// Decode a GitLab `X-Gitlab-Event` payload (`Push Hook` / `Merge Request Hook`).
pub fn decode_gitlab(event_type: &str, body: &[u8]) -> Result<PlatformEvent> {
    let v = parse_json(body)?;

    match event_type {
        "Push Hook" => {
            let clone_url_hint = str_field(&v, &["project", "git_http_url"])
                .or_else(|| str_field(&v, &["repository", "git_http_url"]))
                .unwrap_or_default()
                .to_string();
            let branch = v
                .get("ref")
                .and_then(|r| r.as_str())
                .map(|r| r.trim_start_matches("refs/heads/").to_string())
                .unwrap_or_default();
            let revision_ref = v.get("after").and_then(|r| r.as_str()).unwrap_or_default().to_string();
            let base_ref = v.get("before").and_then(|r| r.as_str()).unwrap_or_default().to_string();
            let last_commit = v.get("commits").and_then(|c| c.as_array()).and_then(|a| a.last());
            let (author_name, author_email) = last_commit
                .map(|last| {
                    (
                        str_field(last, &["author", "name"]).map(String::from),
                        str_field(last, &["author", "email"]).map(String::from),
                    )
                })
                .unwrap_or((None, None));
            let event_time = parse_event_time(last_commit.and_then(|c| c.get("timestamp")).and_then(|t| t.as_str()));

            Ok(PlatformEvent::Push(PushEvent {
                clone_url_hint,
                branch,
                revision_ref,
                base_ref,
                author_name,
                author_email,
                event_time,
            }))
        }
        "Merge Request Hook" => {
            let attrs = v.get("object_attributes").cloned().unwrap_or_default();
            let clone_url_hint = str_field(&v, &["project", "git_http_url"]).unwrap_or_default().to_string();
            let branch = attrs.get("target_branch").and_then(|b| b.as_str()).unwrap_or_default().to_string();
            let revision_ref = str_field(&attrs, &["last_commit", "id"]).unwrap_or_default().to_string();
            let base_ref = attrs.get("source_branch").and_then(|b| b.as_str()).unwrap_or_default().to_string();
            let author_name = str_field(&v, &["user", "name"]).map(String::from);
            let author_email = str_field(&v, &["user", "email"]).map(String::from);
            let event_time = parse_event_time(str_field(&attrs, &["last_commit", "timestamp"]));

            Ok(PlatformEvent::MergeRequest(MrEvent {
                clone_url_hint,
                branch,
                revision_ref,
                base_ref,
                author_name,
                author_email,
                event_time,
            }))
        }
        _ => Ok(PlatformEvent::Unknown(v)),
    }
}

/// Decode a Gitea `X-Gitea-Event` payload (`push` / `pull_request`).
pub fn decode_gitea(event_type: &str, body: &[u8]) -> Result<PlatformEvent> {
    let v = parse_json(body)?;

    match event_type {
        "push" => {
            let clone_url_hint = str_field(&v, &["repository", "clone_url"]).unwrap_or_default().to_string();
            let branch = v
                .get("ref")
                .and_then(|r| r.as_str())
                .map(|r| r.trim_start_matches("refs/heads/").to_string())
                .unwrap_or_default();
            let revision_ref = v.get("after").and_then(|r| r.as_str()).unwrap_or_default().to_string();
            let base_ref = v.get("before").and_then(|r| r.as_str()).unwrap_or_default().to_string();
            let author_name = str_field(&v, &["pusher", "full_name"]).map(String::from);
            let author_email = str_field(&v, &["pusher", "email"]).map(String::from);
            let event_time = parse_event_time(
                str_field(&v, &["head_commit", "timestamp"])
                    .or_else(|| v.get("commits").and_then(|c| c.as_array()).and_then(|a| a.last()).and_then(|c| c.get("timestamp")).and_then(|t| t.as_str())),
            );

            Ok(PlatformEvent::Push(PushEvent {
                clone_url_hint,
                branch,
                revision_ref,
                base_ref,
                author_name,
                author_email,
                event_time,
            }))
        }
        "pull_request" => {
            let pr = v.get("pull_request").cloned().unwrap_or_default();
            let clone_url_hint = str_field(&v, &["repository", "clone_url"]).unwrap_or_default().to_string();
            let branch = str_field(&pr, &["base", "ref"]).unwrap_or_default().to_string();
            let revision_ref = str_field(&pr, &["head", "sha"]).unwrap_or_default().to_string();
            let base_ref = str_field(&pr, &["base", "sha"]).unwrap_or_default().to_string();
            let author_name = str_field(&pr, &["user", "login"]).map(String::from);
            let event_time = parse_event_time(str_field(&pr, &["updated_at"]));

            Ok(PlatformEvent::MergeRequest(MrEvent {
                clone_url_hint,
                branch,
                revision_ref,
                base_ref,
                author_name,
                author_email: None,
                event_time,
            }))
        }
        _ => Ok(PlatformEvent::Unknown(v)),
    }
}

/// Decode a GitHub `X-GitHub-Event` payload (`push` / `pull_request`).
pub fn decode_github(event_type: &str, body: &[u8]) -> Result<PlatformEvent> {
    let v = parse_json(body)?;

    match event_type {
        "push" => {
            let clone_url_hint = str_field(&v, &["repository", "clone_url"]).unwrap_or_default().to_string();
            let branch = v
                .get("ref")
                .and_then(|r| r.as_str())
                .map(|r| r.trim_start_matches("refs/heads/").to_string())
                .unwrap_or_default();
            let revision_ref = v.get("after").and_then(|r| r.as_str()).unwrap_or_default().to_string();
            let base_ref = v.get("before").and_then(|r| r.as_str()).unwrap_or_default().to_string();
            let author_name = str_field(&v, &["pusher", "name"]).map(String::from);
            let author_email = str_field(&v, &["pusher", "email"]).map(String::from);
            let event_time = parse_event_time(
                str_field(&v, &["head_commit", "timestamp"])
                    .or_else(|| v.get("commits").and_then(|c| c.as_array()).and_then(|a| a.last()).and_then(|c| c.get("timestamp")).and_then(|t| t.as_str())),
            );

            Ok(PlatformEvent::Push(PushEvent {
                clone_url_hint,
                branch,
                revision_ref,
                base_ref,
                author_name,
                author_email,
                event_time,
            }))
        }
        "pull_request" => {
            let pr = v.get("pull_request").cloned().unwrap_or_default();
            let clone_url_hint = str_field(&v, &["repository", "clone_url"]).unwrap_or_default().to_string();
            let branch = str_field(&pr, &["base", "ref"]).unwrap_or_default().to_string();
            let revision_ref = str_field(&pr, &["head", "sha"]).unwrap_or_default().to_string();
            let base_ref = str_field(&pr, &["base", "sha"]).unwrap_or_default().to_string();
            let author_name = str_field(&pr, &["user", "login"]).map(String::from);
            let event_time = parse_event_time(str_field(&pr, &["updated_at"]));

            Ok(PlatformEvent::MergeRequest(MrEvent {
                clone_url_hint,
                branch,
                revision_ref,
                base_ref,
                author_name,
                author_email: None,
                event_time,
            }))
        }
        _ => Ok(PlatformEvent::Unknown(v)),
    }
}

pub fn decode(platform: Platform, event_type: &str, body: &[u8]) -> Result<PlatformEvent> {
    match platform {
        Platform::Gitlab => decode_gitlab(event_type, body),
        Platform::Gitea => decode_gitea(event_type, body),
        Platform::Github => decode_github(event_type, body),
    }
}

/// Decode, verify, and enqueue one webhook delivery. Signature mismatches
/// are an auth error (caller returns 401); everything else either creates a
/// task or returns an outcome explaining why it didn't.
pub async fn ingest(
    pool: &sqlx::SqlitePool,
    platform: Platform,
    event_type: &str,
    signature_header: Option<&str>,
    body: &[u8],
) -> Result<WebhookOutcome> {
    let event = decode(platform, event_type, body)?;

    let Some(normalized) = event.normalize() else {
        return Ok(WebhookOutcome::Ignored {
            reason: format!("unrecognized event type: {event_type}"),
        });
    };

    let lookup_key = normalize_clone_url(&normalized.clone_url_hint);
    let Some(repo) = db::find_repository_by_clone_url(pool, &lookup_key).await? else {
        return Ok(WebhookOutcome::Ignored {
            reason: format!("no repo configured for {}", normalized.clone_url_hint),
        });
    };

    if !repo.trigger_mode.accepts_webhook() {
        return Ok(WebhookOutcome::Ignored {
            reason: format!("repo {} does not accept webhooks", repo.repo_id),
        });
    }

    if !verify_signature(platform, repo.webhook_secret.as_deref(), signature_header, body) {
        return Err(ReviewError::Auth("webhook signature verification failed".to_string()));
    }

    if normalized.branch != repo.branch {
        return Ok(WebhookOutcome::Ignored {
            reason: format!("event on branch {} does not match configured branch {}", normalized.branch, repo.branch),
        });
    }
    if normalized.event_time < repo.effective_from {
        return Ok(WebhookOutcome::Ignored {
            reason: format!("event at {} predates effective_from {}", normalized.event_time, repo.effective_from),
        });
    }

    if normalized.strategy == Strategy::MergeRequest && !repo.poll_mrs {
        return Ok(WebhookOutcome::Ignored {
            reason: format!("repo {} does not review merge requests", repo.repo_id),
        });
    }
    if normalized.strategy == Strategy::Commit && !repo.poll_commits {
        return Ok(WebhookOutcome::Ignored {
            reason: format!("repo {} does not review commits", repo.repo_id),
        });
    }

    let task = ReviewTask {
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
        Ok(task_id) => Ok(WebhookOutcome::Created { task_id }),
        Err(db::DbError::Conflict(existing)) => Ok(WebhookOutcome::Duplicate { task_id: existing }),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gitlab_signature_is_plain_token_compare() {
        assert!(verify_signature(Platform::Gitlab, Some("secret"), Some("secret"), b"body"));
        assert!(!verify_signature(Platform::Gitlab, Some("secret"), Some("wrong"), b"body"));
    }

    #[test]
    fn github_signature_requires_sha256_prefix() {
        let digest = compute_hmac_hex("secret", b"hello");
        let header = format!("sha256={digest}");
        assert!(verify_signature(Platform::Github, Some("secret"), Some(&header), b"hello"));
        assert!(!verify_signature(Platform::Github, Some("secret"), Some(&digest), b"hello"));
    }

    #[test]
    fn gitea_signature_is_raw_hex_hmac() {
        let digest = compute_hmac_hex("secret", b"hello");
        assert!(verify_signature(Platform::Gitea, Some("secret"), Some(&digest), b"hello"));
    }

    #[test]
    fn no_secret_configured_accepts_anything() {
        assert!(verify_signature(Platform::Github, None, None, b"hello"));
    }

    #[test]
    fn decode_gitlab_push_extracts_normalized_fields() {
        let body = serde_json::json!({
            "ref": "refs/heads/main",
            "before": "aaa",
            "after": "bbb",
            "project": { "git_http_url": "https://gitlab.example.com/team/repo.git" },
            "commits": [{ "author": { "name": "Ada", "email": "ada@example.com" } }],
        });
        let event = decode_gitlab("Push Hook", body.to_string().as_bytes()).unwrap();
        let normalized = event.normalize().unwrap();
        assert_eq!(normalized.branch, "main");
        assert_eq!(normalized.revision_ref, "bbb");
        assert_eq!(normalized.author_name.as_deref(), Some("Ada"));
    }

    #[test]
    fn decode_github_unknown_event_is_ignored() {
        let event = decode_github("issue_comment", b"{}").unwrap();
        assert!(event.normalize().is_none());
    }

    #[test]
    fn decode_gitea_pull_request_extracts_shas() {
        let body = serde_json::json!({
            "repository": { "clone_url": "https://gitea.example.com/team/repo.git" },
            "pull_request": {
                "base": { "ref": "main", "sha": "base123" },
                "head": { "sha": "head456" },
                "user": { "login": "dev" },
            },
        });
        let event = decode_gitea("pull_request", body.to_string().as_bytes()).unwrap();
        let normalized = event.normalize().unwrap();
        assert_eq!(normalized.strategy, Strategy::MergeRequest);
        assert_eq!(normalized.revision_ref, "head456");
        assert_eq!(normalized.base_ref, "base123");
    }
}
