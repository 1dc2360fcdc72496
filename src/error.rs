//! Error kinds shared across the pipeline.
//!
//! Every component seam returns a typed [`AuditError`] so callers can apply
//! the propagation policy (abort project, retry store, record round failure)
//! by matching on the kind rather than inspecting strings.

use std::path::PathBuf;

/// Pipeline error kinds.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// Invalid or escaping workspace path. Aborts the current project only.
    #[error("workspace error for project '{project_id}': {reason}")]
    Workspace { project_id: String, reason: String },

    /// Malformed tree-sitter export data.
    #[error("catalog error ({path}): {reason}")]
    Catalog { path: PathBuf, reason: String },

    /// Prompt inputs too large or missing.
    #[error("prompt assembly error: {0}")]
    PromptAssembly(String),

    /// Agent subprocess failed to spawn, exited non-zero, or broke a pipe.
    #[error("agent execution error: {0}")]
    Exec(String),

    /// Agent subprocess exceeded its deadline and was terminated.
    #[error("agent timed out after {timeout_sec}s")]
    Timeout { timeout_sec: u64 },

    /// Agent output violated the expected JSON schema.
    #[error("parse error: {0}")]
    Parse(String),

    /// Database failure (retried once with backoff before it reaches here).
    #[error("store error: {0}")]
    Store(String),

    /// Driver-initiated cancellation.
    #[error("cancelled")]
    Cancelled,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for AuditError {
    fn from(e: rusqlite::Error) -> Self {
        AuditError::Store(e.to_string())
    }
}

impl AuditError {
    pub fn workspace(project_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Workspace {
            project_id: project_id.into(),
            reason: reason.into(),
        }
    }

    pub fn catalog(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Catalog {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AuditError>;
