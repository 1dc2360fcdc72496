//! Sandboxed invocation of the external analysis agent.
//!
//! The agent system follows an adapter pattern: [`AgentInvoker`] defines the
//! interface the pipeline stages depend on, [`CodexExecutor`] is the
//! production implementation spawning the `codex exec` CLI, and tests plug in
//! scripted fakes. One invocation is exactly one subprocess, reaped before
//! the call returns.

mod executor;
pub mod output;

pub use executor::CodexExecutor;

use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::SandboxMode;
use crate::error::Result;

/// One agent invocation request.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Pipeline stage, used in the artifact path (`plan`, `reason`, `validate`).
    pub stage: String,
    pub project_id: String,
    /// Call scope inside the stage, e.g. `F3-access_control/round_2`.
    /// Must be unique per call within a stage run.
    pub scope: String,
    /// Working directory of the subprocess; the agent sees nothing outside it.
    pub workspace_root: PathBuf,
    pub prompt: String,
    pub sandbox: SandboxMode,
    /// Per-call deadline override; the executor default applies when `None`.
    pub timeout_sec: Option<u64>,
    /// Driver cancellation root; a cancelled token terminates the subprocess.
    pub cancel: CancellationToken,
}

impl AgentRequest {
    pub fn new(
        stage: impl Into<String>,
        project_id: impl Into<String>,
        scope: impl Into<String>,
        workspace_root: impl Into<PathBuf>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            stage: stage.into(),
            project_id: project_id.into(),
            scope: scope.into(),
            workspace_root: workspace_root.into(),
            prompt: prompt.into(),
            sandbox: SandboxMode::ReadOnly,
            timeout_sec: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_sandbox(mut self, sandbox: SandboxMode) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn with_timeout(mut self, timeout_sec: u64) -> Self {
        self.timeout_sec = Some(timeout_sec);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Captured subprocess output plus timing and artifact location.
#[derive(Debug, Clone)]
pub struct AgentOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    /// ms since epoch.
    pub started_at: i64,
    pub finished_at: i64,
    /// Directory holding `prompt`, `stdout`, `stderr` for this call.
    pub artifact_dir: PathBuf,
}

/// Result of one invocation. Callers pattern-match; agent failures are data,
/// not panics.
#[derive(Debug, Clone)]
pub enum ExecOutcome {
    /// Exit code zero.
    Completed(AgentOutput),
    /// Non-zero exit; streams captured.
    Failed(AgentOutput),
    /// Deadline hit; subprocess terminated, partial streams captured.
    Timeout(AgentOutput),
}

impl ExecOutcome {
    pub fn output(&self) -> &AgentOutput {
        match self {
            ExecOutcome::Completed(o) | ExecOutcome::Failed(o) | ExecOutcome::Timeout(o) => o,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, ExecOutcome::Completed(_))
    }

    /// `ok | error | timeout`, as recorded in validation audit trails.
    pub fn exit_mode(&self) -> &'static str {
        match self {
            ExecOutcome::Completed(_) => "ok",
            ExecOutcome::Failed(_) => "error",
            ExecOutcome::Timeout(_) => "timeout",
        }
    }
}

/// Interface all pipeline stages invoke the agent through.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    /// Run one sandboxed agent call.
    ///
    /// Returns `Err` only for infrastructure failures that precede the
    /// subprocess (artifact directory creation, spawn failure) or for driver
    /// cancellation; agent-side failures come back as
    /// [`ExecOutcome::Failed`] / [`ExecOutcome::Timeout`].
    async fn run(&self, request: AgentRequest) -> Result<ExecOutcome>;
}
