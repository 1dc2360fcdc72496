//! Top-level pipeline driver: stage sequencing, bounded parallelism,
//! cancellation, resumability.
//!
//! Stages run in order per project (parse → plan → reason → validate →
//! export); projects run in parallel up to the configured pool. One
//! cancellation root aborts in-flight agent calls; database writes settle
//! before the run returns.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agent::{AgentInvoker, CodexExecutor};
use crate::catalog::FunctionCatalog;
use crate::config::AuditConfig;
use crate::error::AuditError;
use crate::export;
use crate::planning::PlanningEngine;
use crate::reasoning::ReasoningLoop;
use crate::store::{AuditDb, FindingRepository, TaskRepository};
use crate::validating::Validator;
use crate::workspace::WorkspaceResolver;

/// Which stages to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Plan,
    Reason,
    Validate,
    All,
}

impl Stage {
    fn runs_plan(&self) -> bool {
        matches!(self, Stage::Plan | Stage::All)
    }
    fn runs_reason(&self) -> bool {
        matches!(self, Stage::Reason | Stage::All)
    }
    fn runs_validate(&self) -> bool {
        matches!(self, Stage::Validate | Stage::All)
    }
}

/// Per-project outcome.
#[derive(Debug, Clone, Default)]
pub struct ProjectOutcome {
    pub project_id: String,
    pub planned: usize,
    pub reasoned: usize,
    pub validated: usize,
    pub findings: usize,
    pub errors: usize,
    pub partial: bool,
    pub workspace_error: bool,
    pub executor_fatal: bool,
}

/// Whole-run summary; the CLI maps it onto exit codes.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub projects: Vec<ProjectOutcome>,
}

impl RunSummary {
    pub fn planned(&self) -> usize {
        self.projects.iter().map(|p| p.planned).sum()
    }
    pub fn reasoned(&self) -> usize {
        self.projects.iter().map(|p| p.reasoned).sum()
    }
    pub fn validated(&self) -> usize {
        self.projects.iter().map(|p| p.validated).sum()
    }
    pub fn errors(&self) -> usize {
        self.projects.iter().map(|p| p.errors).sum()
    }

    /// Exit code contract: 0 success, 2 workspace error, 3 unrecoverable
    /// executor error, 4 partial completion.
    pub fn exit_code(&self) -> i32 {
        if self.projects.is_empty() {
            return 2;
        }
        if self.projects.iter().all(|p| p.workspace_error) {
            return 2;
        }
        if self.projects.iter().any(|p| p.executor_fatal) {
            return 3;
        }
        let clean = self
            .projects
            .iter()
            .all(|p| !p.partial && !p.workspace_error && p.errors == 0);
        if clean {
            0
        } else {
            4
        }
    }
}

pub struct PipelineDriver {
    config: AuditConfig,
    db: AuditDb,
    invoker: Arc<dyn AgentInvoker>,
    cancel: CancellationToken,
}

impl PipelineDriver {
    pub fn new(config: AuditConfig) -> anyhow::Result<Self> {
        let db = AuditDb::open(&config.database_path())?;
        let invoker: Arc<dyn AgentInvoker> = Arc::new(CodexExecutor::new(
            config.agent.clone(),
            config.logs_dir(),
        ));
        Ok(Self {
            config,
            db,
            invoker,
            cancel: CancellationToken::new(),
        })
    }

    /// Swap the agent implementation (tests, replays).
    pub fn with_invoker(mut self, invoker: Arc<dyn AgentInvoker>) -> Self {
        self.invoker = invoker;
        self
    }

    /// Root token; cancelling it aborts scheduling and signals running
    /// subprocesses.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn db(&self) -> &AuditDb {
        &self.db
    }

    /// Run the selected stage for the given projects (all manifest projects
    /// when the list is empty).
    pub async fn run(&self, project_ids: &[String], stage: Stage) -> anyhow::Result<RunSummary> {
        let resolver = WorkspaceResolver::load(&self.config.dataset_base)
            .map_err(|e| anyhow::anyhow!("{e}"))?;

        let ids: Vec<String> = if project_ids.is_empty() {
            resolver.project_ids()
        } else {
            project_ids.to_vec()
        };

        let semaphore = Arc::new(Semaphore::new(self.config.max_project_parallel.max(1)));
        let mut handles = Vec::new();
        for project_id in ids {
            let this = ProjectRunner {
                config: self.config.clone(),
                db: self.db.clone(),
                invoker: Arc::clone(&self.invoker),
                cancel: self.cancel.clone(),
                resolver: resolver.clone(),
            };
            let semaphore = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return ProjectOutcome::default(),
                };
                this.run_project(project_id, stage).await
            }));
        }

        let mut summary = RunSummary::default();
        for handle in handles {
            match handle.await {
                Ok(outcome) => summary.projects.push(outcome),
                Err(e) => {
                    error!(error = %e, "project worker panicked");
                    summary.projects.push(ProjectOutcome {
                        project_id: "<panicked>".to_string(),
                        errors: 1,
                        partial: true,
                        ..Default::default()
                    });
                }
            }
        }

        info!(
            planned = summary.planned(),
            reasoned = summary.reasoned(),
            validated = summary.validated(),
            errors = summary.errors(),
            "pipeline run complete"
        );
        Ok(summary)
    }
}

/// One project's stage sequence; owned by its worker task.
struct ProjectRunner {
    config: AuditConfig,
    db: AuditDb,
    invoker: Arc<dyn AgentInvoker>,
    cancel: CancellationToken,
    resolver: WorkspaceResolver,
}

impl ProjectRunner {
    async fn run_project(&self, project_id: String, stage: Stage) -> ProjectOutcome {
        let mut outcome = ProjectOutcome {
            project_id: project_id.clone(),
            ..Default::default()
        };

        // A workspace failure aborts this project but never its siblings.
        let workspace_root = match self.resolver.resolve(&project_id) {
            Ok(root) => root,
            Err(e) => {
                error!(project_id = %project_id, error = %e, "workspace resolution failed");
                outcome.workspace_error = true;
                outcome.errors += 1;
                return outcome;
            }
        };

        let tasks = TaskRepository::new(self.db.clone());
        let findings = FindingRepository::new(self.db.clone());

        if stage.runs_plan() {
            match self.plan(&project_id, &workspace_root, tasks.clone()).await {
                Ok((created, partial)) => {
                    outcome.planned = created;
                    outcome.partial |= partial;
                }
                Err(AuditError::Cancelled) => return outcome,
                Err(AuditError::Workspace { .. }) => {
                    outcome.workspace_error = true;
                    outcome.errors += 1;
                    return outcome;
                }
                Err(e @ (AuditError::Exec(_) | AuditError::Timeout { .. })) => {
                    // Planning produced nothing for this project.
                    error!(project_id = %project_id, error = %e, "planning failed");
                    outcome.executor_fatal =
                        tasks.count_tasks(&project_id).unwrap_or(0) == 0;
                    outcome.errors += 1;
                    return outcome;
                }
                Err(e) => {
                    error!(project_id = %project_id, error = %e, "planning failed");
                    outcome.errors += 1;
                    return outcome;
                }
            }
        }

        if stage.runs_reason() {
            let reasoning = ReasoningLoop::new(
                self.config.clone(),
                Arc::clone(&self.invoker),
                tasks.clone(),
                findings.clone(),
                &project_id,
                workspace_root.clone(),
                self.cancel.clone(),
            );
            match reasoning.run().await {
                Ok(report) => {
                    outcome.reasoned = report.tasks_processed;
                    outcome.findings = report.findings_written;
                    outcome.errors += report.errors;
                    outcome.partial |= report.errors > 0;
                }
                Err(AuditError::Cancelled) => return outcome,
                Err(e) => {
                    error!(project_id = %project_id, error = %e, "reasoning failed");
                    outcome.errors += 1;
                    return outcome;
                }
            }
        }

        if stage.runs_validate() {
            let validator = Validator::new(
                self.config.clone(),
                Arc::clone(&self.invoker),
                findings.clone(),
                &project_id,
                workspace_root.clone(),
                self.cancel.clone(),
            );
            match validator.run().await {
                Ok(report) => {
                    outcome.validated = report.validated;
                    outcome.errors += report.errors;
                    outcome.partial |= report.errors > 0;
                }
                Err(AuditError::Cancelled) => return outcome,
                Err(e) => {
                    error!(project_id = %project_id, error = %e, "validation failed");
                    outcome.errors += 1;
                    return outcome;
                }
            }

            match export::export_project(&findings, &project_id, &self.config.logs_dir()) {
                Ok(paths) => {
                    info!(
                        project_id = %project_id,
                        confirmed = paths.confirmed,
                        report = %paths.markdown.display(),
                        "exported report"
                    );
                }
                Err(e) => {
                    warn!(project_id = %project_id, error = %e, "export failed");
                    outcome.partial = true;
                }
            }
        }

        outcome
    }

    /// Parse + plan. Reads the tree-sitter export and runs the planning
    /// engine.
    async fn plan(
        &self,
        project_id: &str,
        workspace_root: &Path,
        tasks: TaskRepository,
    ) -> crate::error::Result<(usize, bool)> {
        let functions_path = self.config.functions_json_for(workspace_root);
        let catalog = FunctionCatalog::load(&functions_path)?;
        info!(
            project_id = %project_id,
            functions = catalog.len(),
            export = %functions_path.display(),
            "catalog loaded"
        );

        let engine = PlanningEngine::new(
            self.config.clone(),
            Arc::clone(&self.invoker),
            tasks,
            project_id,
            workspace_root.to_path_buf(),
            self.cancel.clone(),
        );
        let report = engine.run(&catalog).await?;
        Ok((report.tasks_created, report.partial))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(project_id: &str) -> ProjectOutcome {
        ProjectOutcome {
            project_id: project_id.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn exit_codes_follow_the_contract() {
        let mut summary = RunSummary::default();
        assert_eq!(summary.exit_code(), 2, "no projects at all");

        summary.projects.push(outcome("a"));
        assert_eq!(summary.exit_code(), 0, "clean run");

        summary.projects[0].errors = 1;
        summary.projects[0].partial = true;
        assert_eq!(summary.exit_code(), 4, "partial completion");

        summary.projects[0].executor_fatal = true;
        assert_eq!(summary.exit_code(), 3, "unrecoverable executor error");

        let mut ws = RunSummary::default();
        ws.projects.push(ProjectOutcome {
            workspace_error: true,
            ..outcome("a")
        });
        assert_eq!(ws.exit_code(), 2, "all projects workspace-failed");

        // One workspace failure among healthy siblings is partial, not fatal.
        ws.projects.push(outcome("b"));
        assert_eq!(ws.exit_code(), 4);
    }
}
