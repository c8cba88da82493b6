//! Crate-wide error taxonomy.
//!
//! Each variant corresponds to one row of the error-handling design: its
//! recovery policy is encoded in where callers match on it, not in the
//! type itself. Nothing in this crate discards an `Err` silently - every
//! fallible path either propagates a `ReviewError` or records one on a
//! task via the Task Store.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReviewError>;

#[derive(Error, Debug)]
pub enum ReviewError {
    /// Malformed input at an ingestion boundary: unparseable webhook body,
    /// unknown platform, invalid repo configuration. No task is created.
    #[error("validation: {0}")]
    Validation(String),

    /// Bad signature, bad platform token, bad API key.
    #[error("authentication: {0}")]
    Auth(String),

    /// Platform API 5xx, VCS network error - retried up to 3 times by the
    /// caller before this is recorded as a terminal task failure.
    #[error("transient external error ({kind}): {source}")]
    Transient {
        kind: String,
        #[source]
        source: anyhow::Error,
    },

    /// Assistant subprocess non-zero exit or timeout for one batch.
    #[error("subprocess failure: {0}")]
    Subprocess(String),

    /// Assistant report did not match any recognized section format.
    #[error("parse failure: {0}")]
    Parse(String),

    /// State-machine violation, store conflict, or other programmer-visible
    /// invariant break. Logged at error level; process continues.
    #[error("internal invariant violated: {0}")]
    Internal(String),

    /// Database unopenable, migration failed - process aborts at startup.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("database error: {0}")]
    Db(#[from] crate::db::DbError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ReviewError {
    pub fn transient(kind: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::Transient {
            kind: kind.into(),
            source: source.into(),
        }
    }

    /// Whether this error kind is worth retrying within the same task,
    /// per the `Transient external` row of the error-handling table.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReviewError::Transient { .. })
    }
}

/// Retry a fallible async operation up to 3 attempts with 1s/4s/16s backoff,
/// stopping early on the first non-retryable error. Named after the
/// `initial_retry_delay_ms`/`max_retry_delay_ms` pair the teacher's
/// `webhooks.rs` doc comments describe but never wire up; here it's an
/// actual helper shared by `platform_client` and `working_copy`, the two
/// places a transient network failure shouldn't fail a task outright.
pub async fn retry_with_backoff<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    const DELAYS_SECS: [u64; 3] = [1, 4, 16];
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < DELAYS_SECS.len() => {
                tokio::time::sleep(std::time::Duration::from_secs(DELAYS_SECS[attempt])).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
