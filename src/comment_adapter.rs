//! Comment Adapter.
//!
//! Best-effort posting of a finished task's report back to the originating
//! platform. Out of scope per the Non-goals: delivery is never guaranteed,
//! so every failure here is logged and swallowed rather than propagated -
//! it must never flip a task's already-computed status. Shaped after the
//! `publish` step's `dry_run` flag and idempotency-marker approach in
//! `mr-reviewer/src/publish/mod.rs`, simplified from its discussion/note
//! dispatch down to the single "one comment per task" shape this engine
//! needs.

use tracing::{info, warn};

use crate::platform_client::PlatformClient;

#[derive(Debug, Clone)]
pub struct CommentAdapterConfig {
    /// When true, compute and log what would be posted without calling out.
    pub dry_run: bool,
}

impl Default for CommentAdapterConfig {
    fn default() -> Self {
        Self { dry_run: true }
    }
}

fn idempotency_marker(task_id: &str) -> String {
    format!("<!-- review-engine:task:{task_id} -->")
}

/// Whether a comment already carrying this task's marker exists in `body`,
/// so a retried delivery after a crash doesn't double-post.
pub fn already_posted(existing_body: &str, task_id: &str) -> bool {
    existing_body.contains(&idempotency_marker(task_id))
}

/// Post `report_body` for `task_id`, returning whether a network call was
/// actually made. Never returns an error - failures are logged at `warn!`
/// and treated as "not posted", matching the Open Question decision that
/// comment-posting failures are non-fatal notes, not task failures.
pub async fn post_report(
    client: &dyn PlatformClient,
    project: &str,
    revision_ref: &str,
    task_id: &str,
    report_body: &str,
    config: &CommentAdapterConfig,
) -> bool {
    let body = format!("{report_body}\n\n{}", idempotency_marker(task_id));

    if config.dry_run {
        info!(task_id, project, "comment adapter dry run, not posting");
        return false;
    }

    match client.post_comment(project, revision_ref, &body).await {
        Ok(()) => {
            info!(task_id, project, "posted review comment");
            true
        }
        Err(e) => {
            warn!(task_id, project, error = %e, "failed to post review comment, continuing");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::platform_client::{RemoteCommit, RemoteMergeRequest};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingClient {
        posts: AtomicUsize,
    }

    #[async_trait]
    impl PlatformClient for RecordingClient {
        async fn list_commits(
            &self,
            _project: &str,
            _branch: &str,
            _since: Option<chrono::DateTime<chrono::Utc>>,
        ) -> Result<Vec<RemoteCommit>> {
            unreachable!("not exercised by comment adapter tests")
        }

        async fn list_merge_requests(
            &self,
            _project: &str,
            _target_branch: &str,
        ) -> Result<Vec<RemoteMergeRequest>> {
            unreachable!("not exercised by comment adapter tests")
        }

        async fn post_comment(&self, _project: &str, _revision_ref: &str, _body: &str) -> Result<()> {
            self.posts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn idempotency_marker_is_detected() {
        let body = format!("some report\n\n{}", idempotency_marker("t1"));
        assert!(already_posted(&body, "t1"));
        assert!(!already_posted(&body, "t2"));
    }

    #[tokio::test]
    async fn dry_run_never_calls_the_client() {
        let client = RecordingClient::default();
        let config = CommentAdapterConfig { dry_run: true };
        let posted = post_report(&client, "team/repo", "abc123", "t1", "report", &config).await;
        assert!(!posted);
        assert_eq!(client.posts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn live_run_posts_once() {
        let client = RecordingClient::default();
        let config = CommentAdapterConfig { dry_run: false };
        let posted = post_report(&client, "team/repo", "abc123", "t1", "report", &config).await;
        assert!(posted);
        assert_eq!(client.posts.load(Ordering::SeqCst), 1);
    }
}
