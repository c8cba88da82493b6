//! Assistant Runner (C5).
//!
//! Spawns the external code-assistant subprocess once per batch, writes the
//! batch prompt to its stdin, collects stdout/stderr, and enforces a
//! per-batch time budget. Piped stdin/stdout handling follows the same
//! `Stdio` shape the teacher uses for `git` subprocesses in
//! `src/repo_manager.rs`; the timeout-then-kill sequencing is new, since the
//! teacher never runs a subprocess that can legitimately hang.
//!
//! [`ChildGuard`] exists so that a cancelled task, a panicking batch future,
//! or a normal return path all converge on the same cleanup: the child is
//! asked to terminate, then forcefully killed if it hasn't exited after a
//! grace period, and always reaped so it never becomes a zombie.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{ReviewError, Result};
use crate::models::RepoAuth;

#[derive(Debug, Clone)]
pub struct AssistantRunConfig {
    /// Path to the assistant executable.
    pub command: String,
    /// Extra args passed before the batch prompt is piped to stdin.
    pub args: Vec<String>,
    /// Wall-clock budget for one batch invocation.
    pub timeout: Duration,
    /// Grace period after a graceful terminate request before a hard kill.
    pub kill_grace: Duration,
}

impl Default for AssistantRunConfig {
    fn default() -> Self {
        Self {
            command: "code-assistant".to_string(),
            args: Vec::new(),
            timeout: Duration::from_secs(1800),
            kill_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

/// RAII guard that kills and reaps a [`Child`] on drop unless it has
/// already been awaited to completion. Covers cancellation and panic
/// unwinding paths the same way a plain `.wait()` call would not.
struct ChildGuard {
    child: Option<Child>,
}

impl ChildGuard {
    fn new(child: Child) -> Self {
        Self { child: Some(child) }
    }

    fn take(mut self) -> Child {
        self.child.take().expect("child already taken")
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Ok(Some(_)) = child.try_wait() {
                return;
            }
            let _ = child.start_kill();
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
        }
    }
}

/// Waits until `rx` carries `true`. A receiver whose sender has been
/// dropped while still `false` never cancels - passing `None` disables
/// cancellation entirely the same way.
async fn wait_for_cancel(rx: Option<&mut watch::Receiver<bool>>) {
    match rx {
        Some(rx) => loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        },
        None => std::future::pending().await,
    }
}

async fn terminate(child: &mut Child, kill_grace: Duration) {
    let _ = child.start_kill();
    let grace = tokio::time::sleep(kill_grace);
    tokio::select! {
        _ = child.wait() => {}
        _ = grace => {
            let _ = child.kill().await;
        }
    }
}

/// Run one batch through the assistant subprocess, writing `prompt` to its
/// stdin and collecting stdout/stderr under the configured time budget.
/// Environment credentials are passed via an isolated env map rather than
/// inherited, so one repo's token is never visible to a batch for another.
/// `cancel`, when provided, lets the scheduler's per-task cancellation
/// signal interrupt a batch that is already running, the same way a
/// timeout does.
pub async fn run_batch(
    config: &AssistantRunConfig,
    prompt: &str,
    repo_env: &[(&str, &str)],
    auth: Option<&RepoAuth>,
    mut cancel: Option<watch::Receiver<bool>>,
) -> Result<BatchOutcome> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.env_clear();
    cmd.env("PATH", std::env::var("PATH").unwrap_or_default());

    for (key, value) in repo_env {
        cmd.env(key, value);
    }

    if let Some(RepoAuth::Token { value }) = auth {
        cmd.env("REVIEW_ENGINE_REPO_TOKEN", value);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| ReviewError::Subprocess(format!("failed to spawn {}: {e}", config.command)))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| ReviewError::Internal("child stdin not piped".to_string()))?;
    let prompt_owned = prompt.to_string();
    let write_task = tokio::spawn(async move {
        let result = stdin.write_all(prompt_owned.as_bytes()).await;
        let _ = stdin.shutdown().await;
        result
    });

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| ReviewError::Internal("child stdout not piped".to_string()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| ReviewError::Internal("child stderr not piped".to_string()))?;
    let stdout_task = tokio::spawn(async move {
        let mut buf = String::new();
        let _ = stdout.read_to_string(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = String::new();
        let _ = stderr.read_to_string(&mut buf).await;
        buf
    });

    let guard = ChildGuard::new(child);
    let mut child = guard.take();

    tokio::select! {
        status = child.wait() => {
            let status = status.map_err(|e| ReviewError::Subprocess(format!("child wait failed: {e}")))?;
            let _ = write_task.await;
            let stdout_buf = stdout_task.await.unwrap_or_default();
            let stderr_buf = stderr_task.await.unwrap_or_default();
            debug!(exit = ?status.code(), "assistant batch finished");
            Ok(BatchOutcome {
                stdout: stdout_buf,
                stderr: stderr_buf,
                exit_code: status.code(),
            })
        }
        _ = tokio::time::sleep(config.timeout) => {
            warn!(timeout_secs = config.timeout.as_secs(), "assistant batch timed out, terminating");
            terminate(&mut child, config.kill_grace).await;
            Err(ReviewError::Subprocess(format!(
                "assistant did not finish within {}s",
                config.timeout.as_secs()
            )))
        }
        _ = wait_for_cancel(cancel.as_mut()) => {
            warn!("assistant batch cancelled, terminating");
            terminate(&mut child, config.kill_grace).await;
            Err(ReviewError::Subprocess("assistant batch cancelled".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_config() -> AssistantRunConfig {
        AssistantRunConfig {
            command: "cat".to_string(),
            args: vec![],
            timeout: Duration::from_secs(5),
            kill_grace: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn run_batch_echoes_stdin_to_stdout() {
        let config = echo_config();
        let outcome = run_batch(&config, "hello batch", &[], None, None).await.unwrap();
        assert_eq!(outcome.stdout, "hello batch");
        assert_eq!(outcome.exit_code, Some(0));
    }

    #[tokio::test]
    async fn run_batch_times_out_on_a_hanging_process() {
        let config = AssistantRunConfig {
            command: "sleep".to_string(),
            args: vec!["5".to_string()],
            timeout: Duration::from_millis(200),
            kill_grace: Duration::from_millis(100),
        };
        let result = run_batch(&config, "", &[], None, None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn run_batch_reports_nonzero_exit() {
        let config = AssistantRunConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "exit 3".to_string()],
            timeout: Duration::from_secs(5),
            kill_grace: Duration::from_secs(1),
        };
        let outcome = run_batch(&config, "", &[], None, None).await.unwrap();
        assert_eq!(outcome.exit_code, Some(3));
    }

    #[tokio::test]
    async fn run_batch_cancels_a_hanging_process() {
        let config = AssistantRunConfig {
            command: "sleep".to_string(),
            args: vec!["5".to_string()],
            timeout: Duration::from_secs(5),
            kill_grace: Duration::from_millis(100),
        };
        let (tx, rx) = watch::channel(false);
        let run = tokio::spawn(async move { run_batch(&config, "", &[], None, Some(rx)).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        let result = run.await.unwrap();
        assert!(result.is_err());
    }
}
