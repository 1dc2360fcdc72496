//! `codex exec` subprocess executor.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::{AgentInvoker, AgentOutput, AgentRequest, ExecOutcome};
use crate::config::AgentSettings;
use crate::error::{AuditError, Result};

/// Grace period between terminate and kill.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Production agent executor.
///
/// Every call writes its artifacts under
/// `logs/<stage>_<project_id>_<ts>/<scope>/`; a scope collision within the
/// same second gets a random suffix, so concurrent calls never share a
/// directory.
pub struct CodexExecutor {
    settings: AgentSettings,
    logs_dir: PathBuf,
}

impl CodexExecutor {
    pub fn new(settings: AgentSettings, logs_dir: PathBuf) -> Self {
        Self { settings, logs_dir }
    }

    fn build_args(&self, request: &AgentRequest) -> Vec<String> {
        // `--ask-for-approval` is a global flag and must precede `exec`.
        let mut args = vec![
            "--ask-for-approval".to_string(),
            "never".to_string(),
            "exec".to_string(),
        ];
        if let Some(model) = self.settings.model.as_deref() {
            args.push("-m".to_string());
            args.push(model.to_string());
        }
        args.push("-s".to_string());
        args.push(request.sandbox.as_str().to_string());
        args.push("--skip-git-repo-check".to_string());
        args.push("--cd".to_string());
        args.push(request.workspace_root.display().to_string());
        // Prompt arrives on stdin to avoid command-line length limits.
        args.push("-".to_string());
        args
    }

    fn artifact_dir(&self, request: &AgentRequest) -> PathBuf {
        let ts = chrono::Utc::now().format("%Y%m%dT%H%M%S");
        let run_dir = self
            .logs_dir
            .join(format!("{}_{}_{}", request.stage, request.project_id, ts));
        let mut dir = run_dir.join(&request.scope);
        if dir.exists() {
            let suffix = uuid::Uuid::new_v4().to_string();
            dir = run_dir.join(format!("{}-{}", request.scope, &suffix[..8]));
        }
        dir
    }
}

#[async_trait]
impl AgentInvoker for CodexExecutor {
    async fn run(&self, request: AgentRequest) -> Result<ExecOutcome> {
        let artifact_dir = self.artifact_dir(&request);
        std::fs::create_dir_all(&artifact_dir)?;
        std::fs::write(artifact_dir.join("prompt"), &request.prompt)?;

        let timeout_sec = request.timeout_sec.unwrap_or(self.settings.timeout_sec);
        let args = self.build_args(&request);
        debug!(
            binary = %self.settings.binary,
            scope = %request.scope,
            sandbox = request.sandbox.as_str(),
            timeout_sec,
            "spawning agent"
        );

        let started_at = chrono::Utc::now().timestamp_millis();
        let mut command = Command::new(&self.settings.binary);
        command
            .args(&args)
            .current_dir(&request.workspace_root)
            .envs(&self.settings.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a timeout can take the agent's helpers
        // (rg/grep subshells) down with it and the capture pipes close.
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command
            .spawn()
            .map_err(|e| AuditError::Exec(format!("failed to spawn {}: {e}", self.settings.binary)))?;

        // The prompt is fed concurrently with output capture: blocking on a
        // full stdin pipe while the agent already floods stdout would
        // deadlock both sides. A write error just means the agent exited
        // early; the exit code tells the rest of the story.
        if let Some(mut stdin) = child.stdin.take() {
            let prompt = request.prompt.clone();
            tokio::spawn(async move {
                let _ = stdin.write_all(prompt.as_bytes()).await;
            });
        }

        let mut stdout_pipe = child
            .stdout
            .take()
            .ok_or_else(|| AuditError::Exec("failed to capture stdout pipe".into()))?;
        let mut stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| AuditError::Exec("failed to capture stderr pipe".into()))?;

        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stdout_pipe.read_to_end(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr_pipe.read_to_end(&mut buf).await;
            buf
        });

        let mut timed_out = false;
        let mut cancelled = false;
        let status = tokio::select! {
            status = child.wait() => {
                Some(status.map_err(|e| AuditError::Exec(format!("wait failed: {e}")))?)
            }
            _ = tokio::time::sleep(Duration::from_secs(timeout_sec)) => {
                timed_out = true;
                terminate_then_kill(&mut child).await;
                None
            }
            _ = request.cancel.cancelled() => {
                cancelled = true;
                terminate_then_kill(&mut child).await;
                None
            }
        };

        let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).into_owned();
        let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).into_owned();
        let finished_at = chrono::Utc::now().timestamp_millis();

        std::fs::write(artifact_dir.join("stdout"), &stdout)?;
        std::fs::write(artifact_dir.join("stderr"), &stderr)?;

        if cancelled {
            return Err(AuditError::Cancelled);
        }

        let output = AgentOutput {
            stdout,
            stderr,
            exit_code: status.as_ref().and_then(|s| s.code()),
            started_at,
            finished_at,
            artifact_dir,
        };

        if timed_out {
            warn!(scope = %request.scope, timeout_sec, "agent call timed out");
            return Ok(ExecOutcome::Timeout(output));
        }
        match status {
            Some(s) if s.success() => Ok(ExecOutcome::Completed(output)),
            _ => Ok(ExecOutcome::Failed(output)),
        }
    }
}

/// Terminate the process group gracefully, then kill after the grace
/// period. The child is always reaped before this returns.
async fn terminate_then_kill(child: &mut Child) {
    signal_group(child, Signal::Term);
    let graceful = tokio::time::timeout(TERM_GRACE, child.wait()).await;
    if graceful.is_err() {
        signal_group(child, Signal::Kill);
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: Signal) {
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    if let Some(pid) = child.id() {
        unsafe {
            // Negative pid addresses the whole process group.
            libc::kill(-(pid as libc::pid_t), sig);
        }
    }
}

#[cfg(not(unix))]
fn signal_group(child: &Child, _signal: Signal) {
    // No group signalling off unix; the start_kill in the caller handles
    // the direct child.
    let _ = child;
}
