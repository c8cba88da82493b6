//! Domain types shared between the database layer and the engine
//! components. Kept separate from `db::core`'s persistence functions the
//! same way the teacher splits `Note`/`Repository`/`Task` (co-located with
//! their queries in `db/core.rs`) from `QueueItem`/`QueueStage` (defined in
//! `db/queue.rs`) - here the type surface is large enough that it gets its
//! own module while persistence stays in `db`.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Repository configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Gitlab,
    Gitea,
    Github,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Gitlab => write!(f, "gitlab"),
            Platform::Gitea => write!(f, "gitea"),
            Platform::Github => write!(f, "github"),
        }
    }
}

impl std::str::FromStr for Platform {
    type Err = crate::error::ReviewError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gitlab" => Ok(Platform::Gitlab),
            "gitea" => Ok(Platform::Gitea),
            "github" => Ok(Platform::Github),
            other => Err(crate::error::ReviewError::Validation(format!(
                "unknown platform: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    Webhook,
    Polling,
    Both,
}

impl TriggerMode {
    pub fn accepts_webhook(&self) -> bool {
        matches!(self, TriggerMode::Webhook | TriggerMode::Both)
    }

    pub fn accepts_polling(&self) -> bool {
        matches!(self, TriggerMode::Polling | TriggerMode::Both)
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RepoAuth {
    None,
    HttpBasic { user: String, password: String },
    Token { value: String },
}

/// Redact secrets from diagnostic output (Design Note §9).
impl fmt::Debug for RepoAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepoAuth::None => write!(f, "RepoAuth::None"),
            RepoAuth::HttpBasic { user, .. } => {
                write!(f, "RepoAuth::HttpBasic {{ user: {user:?}, password: \"***\" }}")
            }
            RepoAuth::Token { .. } => write!(f, "RepoAuth::Token {{ value: \"***\" }}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloneStatus {
    Absent,
    Cloning,
    Cloned,
    Failed,
}

impl fmt::Display for CloneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloneStatus::Absent => "absent",
            CloneStatus::Cloning => "cloning",
            CloneStatus::Cloned => "cloned",
            CloneStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for CloneStatus {
    type Err = crate::error::ReviewError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "absent" => Ok(CloneStatus::Absent),
            "cloning" => Ok(CloneStatus::Cloning),
            "cloned" => Ok(CloneStatus::Cloned),
            "failed" => Ok(CloneStatus::Failed),
            other => Err(crate::error::ReviewError::Internal(format!(
                "unknown clone_status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    pub repo_id: String,
    pub name: String,
    pub clone_url: String,
    pub branch: String,
    pub platform: Platform,
    pub auth: RepoAuth,
    pub trigger_mode: TriggerMode,
    pub polling_interval_minutes: i64,
    pub effective_from: chrono::DateTime<chrono::Utc>,
    pub poll_commits: bool,
    pub poll_mrs: bool,
    pub enable_comment: bool,
    pub enabled: bool,
    pub local_path: Option<String>,
    pub clone_status: CloneStatus,
    pub last_check_time: Option<chrono::DateTime<chrono::Utc>>,
    pub webhook_secret: Option<String>,
}

// ============================================================================
// Revision marker
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RevisionKind {
    Commit,
    Mr,
}

impl fmt::Display for RevisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RevisionKind::Commit => write!(f, "commit"),
            RevisionKind::Mr => write!(f, "mr"),
        }
    }
}

impl std::str::FromStr for RevisionKind {
    type Err = crate::error::ReviewError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "commit" => Ok(RevisionKind::Commit),
            "mr" => Ok(RevisionKind::Mr),
            other => Err(crate::error::ReviewError::Internal(format!(
                "unknown revision kind: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionMarker {
    pub repo_id: String,
    pub branch: String,
    pub kind: RevisionKind,
    pub last_seen_id: Option<String>,
    pub last_seen_at: Option<chrono::DateTime<chrono::Utc>>,
}

// ============================================================================
// Review task
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Commit,
    MergeRequest,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Commit => write!(f, "commit"),
            Strategy::MergeRequest => write!(f, "merge_request"),
        }
    }
}

impl std::str::FromStr for Strategy {
    type Err = crate::error::ReviewError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "commit" => Ok(Strategy::Commit),
            "merge_request" => Ok(Strategy::MergeRequest),
            other => Err(crate::error::ReviewError::Validation(format!(
                "unknown strategy: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = crate::error::ReviewError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(crate::error::ReviewError::Internal(format!(
                "unknown task status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Success,
    Failed,
    Cancelled,
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Success => "success",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub index: usize,
    pub status: BatchStatus,
    pub files: Vec<String>,
    pub oversize: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewTask {
    pub task_id: String,
    pub repo_id: String,
    pub strategy: Strategy,
    pub revision_ref: String,
    pub base_ref: String,
    pub branch: String,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    pub status: TaskStatus,
    pub batch_total: usize,
    pub batch_current: usize,
    pub batch_results: Vec<BatchResult>,
    pub issues_count: i64,
    pub critical_count: i64,
    pub warning_count: i64,
    pub suggestion_count: i64,
    pub quality_score: i64,
    pub files_reviewed: Vec<String>,
    pub report: Option<String>,
    pub processing_time_seconds: Option<f64>,
    pub verdict: Option<String>,
    pub risk_level: Option<RiskLevel>,
    pub fail_reason: Option<String>,
}

impl ReviewTask {
    /// Quality score per §4.6: 100 - (10*critical + 3*warning + 1*suggestion), clamped.
    pub fn compute_quality_score(critical: i64, warning: i64, suggestion: i64) -> i64 {
        let raw = 100 - (10 * critical + 3 * warning + suggestion);
        raw.clamp(0, 100)
    }

    pub fn compute_risk_level(critical: i64, warning: i64) -> RiskLevel {
        if critical > 0 {
            RiskLevel::High
        } else if warning > 0 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

// ============================================================================
// Issue
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Suggestion,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Critical => "critical",
            Severity::Warning => "warning",
            Severity::Suggestion => "suggestion",
            Severity::Info => "info",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Severity {
    type Err = crate::error::ReviewError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Severity::Critical),
            "warning" => Ok(Severity::Warning),
            "suggestion" => Ok(Severity::Suggestion),
            "info" => Ok(Severity::Info),
            other => Err(crate::error::ReviewError::Internal(format!(
                "unknown severity: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub task_id: String,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub file_path: Option<String>,
    pub line_number: Option<i64>,
    pub code_snippet: Option<String>,
    pub suggestion: Option<String>,
    pub category: Option<String>,
}

// ============================================================================
// Changed files (Working-Copy Manager output)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangedFile {
    pub path: String,
    pub additions: usize,
    pub deletions: usize,
}

// ============================================================================
// Platform events (Design Note §9)
// ============================================================================

#[derive(Debug, Clone)]
pub enum PlatformEvent {
    Push(PushEvent),
    MergeRequest(MrEvent),
    Unknown(serde_json::Value),
}

#[derive(Debug, Clone)]
pub struct PushEvent {
    pub clone_url_hint: String,
    pub branch: String,
    pub revision_ref: String,
    pub base_ref: String,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
    pub event_time: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone)]
pub struct MrEvent {
    pub clone_url_hint: String,
    pub branch: String,
    pub revision_ref: String,
    pub base_ref: String,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
    pub event_time: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone)]
pub struct NormalizedEvent {
    pub clone_url_hint: String,
    pub branch: String,
    pub kind: RevisionKind,
    pub strategy: Strategy,
    pub revision_ref: String,
    pub base_ref: String,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
    pub event_time: chrono::DateTime<chrono::Utc>,
}

impl PlatformEvent {
    pub fn normalize(&self) -> Option<NormalizedEvent> {
        match self {
            PlatformEvent::Push(p) => Some(NormalizedEvent {
                clone_url_hint: p.clone_url_hint.clone(),
                branch: p.branch.clone(),
                kind: RevisionKind::Commit,
                strategy: Strategy::Commit,
                revision_ref: p.revision_ref.clone(),
                base_ref: p.base_ref.clone(),
                author_name: p.author_name.clone(),
                author_email: p.author_email.clone(),
                event_time: p.event_time,
            }),
            PlatformEvent::MergeRequest(m) => Some(NormalizedEvent {
                clone_url_hint: m.clone_url_hint.clone(),
                branch: m.branch.clone(),
                kind: RevisionKind::Mr,
                strategy: Strategy::MergeRequest,
                revision_ref: m.revision_ref.clone(),
                base_ref: m.base_ref.clone(),
                author_name: m.author_name.clone(),
                author_email: m.author_email.clone(),
                event_time: m.event_time,
            }),
            PlatformEvent::Unknown(_) => None,
        }
    }
}

/// Normalize a clone URL for case-insensitive matching with `.git` suffix
/// stripped, per webhook ingestion rule 3.
pub fn normalize_clone_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    let without_suffix = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    without_suffix.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_score_clamps_to_zero() {
        assert_eq!(ReviewTask::compute_quality_score(20, 0, 0), 0);
    }

    #[test]
    fn quality_score_formula() {
        assert_eq!(ReviewTask::compute_quality_score(1, 2, 3), 100 - 10 - 6 - 3);
    }

    #[test]
    fn risk_level_from_counts() {
        assert_eq!(ReviewTask::compute_risk_level(1, 0), RiskLevel::High);
        assert_eq!(ReviewTask::compute_risk_level(0, 2), RiskLevel::Medium);
        assert_eq!(ReviewTask::compute_risk_level(0, 0), RiskLevel::Low);
    }

    #[test]
    fn clone_url_normalization() {
        assert_eq!(
            normalize_clone_url("HTTPS://Example.com/Foo/Bar.git/"),
            "https://example.com/foo/bar"
        );
        assert_eq!(
            normalize_clone_url("https://example.com/foo/bar"),
            "https://example.com/foo/bar"
        );
    }

    #[test]
    fn repo_auth_debug_redacts_secret() {
        let auth = RepoAuth::Token {
            value: "super-secret".to_string(),
        };
        let debug = format!("{:?}", auth);
        assert!(!debug.contains("super-secret"));
    }
}
