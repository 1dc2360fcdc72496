//! Planning stage: carve a project into scannable business-flow tasks.
//!
//! Phase A (P0→P1→P2) extracts groups and flows with the agent and converges
//! them into strict JSON. Phase B (P3→P4→P5) repairs catalog coverage until
//! the target is met or the round cap is hit. Finalize emits one task per
//! (flow × rule key).

pub mod model;
pub mod prompts;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{output::extract_json_object, AgentInvoker, AgentRequest, ExecOutcome};
use crate::catalog::FunctionCatalog;
use crate::config::AuditConfig;
use crate::error::{AuditError, Result};
use crate::store::{Task, TaskRepository};

use model::{parse_overview_lines, PlanningSnapshot, PlanningState, RepairDelta, ResolvedFlow};

/// Outcome summary of one planning run.
#[derive(Debug, Clone, Default)]
pub struct PlanningReport {
    pub skipped: bool,
    /// One or more agent phases degraded to a fallback; tasks were still
    /// written for every JSON-valid flow.
    pub partial: bool,
    pub coverage: f64,
    pub flows: usize,
    pub tasks_created: usize,
}

pub struct PlanningEngine {
    config: AuditConfig,
    invoker: Arc<dyn AgentInvoker>,
    tasks: TaskRepository,
    project_id: String,
    workspace_root: PathBuf,
    cancel: CancellationToken,
}

impl PlanningEngine {
    pub fn new(
        config: AuditConfig,
        invoker: Arc<dyn AgentInvoker>,
        tasks: TaskRepository,
        project_id: impl Into<String>,
        workspace_root: PathBuf,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            invoker,
            tasks,
            project_id: project_id.into(),
            workspace_root,
            cancel,
        }
    }

    /// Run planning for the project. A project that already has tasks is a
    /// no-op (resume semantics).
    pub async fn run(&self, catalog: &FunctionCatalog) -> Result<PlanningReport> {
        if self.tasks.count_tasks(&self.project_id).map_err(store_err)? > 0 {
            info!(project_id = %self.project_id, "tasks already exist, skipping planning");
            return Ok(PlanningReport {
                skipped: true,
                ..Default::default()
            });
        }

        let mut report = PlanningReport::default();
        let mut state = self.forward_extraction(catalog, &mut report).await?;
        self.coverage_repair(catalog, &mut state, &mut report).await?;

        report.coverage = state.coverage(catalog);
        report.flows = state.flows.len();

        let resolved = state.resolve_flows(catalog);
        let tasks = self.finalize_tasks(catalog, &resolved);
        report.tasks_created = self.tasks.bulk_insert_tasks(&tasks).map_err(store_err)?;

        info!(
            project_id = %self.project_id,
            coverage = report.coverage,
            flows = report.flows,
            tasks = report.tasks_created,
            partial = report.partial,
            "planning finished"
        );
        Ok(report)
    }

    /// Phase A: P0 → P1 → P2.
    async fn forward_extraction(
        &self,
        catalog: &FunctionCatalog,
        report: &mut PlanningReport,
    ) -> Result<PlanningState> {
        let p0_out = self
            .call("p0", &prompts::p0_initial(&catalog.identity_block()))
            .await?;
        let p1_out = self.call("p1", &prompts::p1_incremental(&p0_out)).await?;

        let p2_prompt = prompts::p2_final_json(&p0_out, &p1_out);
        let snapshot = match self.call_for_json(&p2_prompt, "p2").await? {
            Some(value) => match serde_json::from_value::<PlanningSnapshot>(value) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(error = %e, "P2 JSON did not match the planning schema, using overview fallback");
                    report.partial = true;
                    parse_overview_lines(&format!("{p0_out}\n{p1_out}"))
                }
            },
            None => {
                warn!("P2 convergence failed twice, using overview fallback");
                report.partial = true;
                parse_overview_lines(&format!("{p0_out}\n{p1_out}"))
            }
        };

        Ok(PlanningState::from_snapshot(snapshot))
    }

    /// Phase B: repair rounds while coverage is below target.
    async fn coverage_repair(
        &self,
        catalog: &FunctionCatalog,
        state: &mut PlanningState,
        report: &mut PlanningReport,
    ) -> Result<()> {
        let target = self.config.planning.coverage_target;
        let mut round = 0u32;

        while state.coverage(catalog) < target && round < self.config.planning.max_repair_rounds {
            round += 1;
            self.check_cancelled()?;

            let covered = state.covered_set(catalog);
            let uncovered: Vec<usize> = (0..catalog.len())
                .filter(|idx| !covered.contains(idx))
                .collect();
            if uncovered.is_empty() {
                break;
            }
            info!(
                round,
                uncovered = uncovered.len(),
                coverage = state.coverage(catalog),
                "coverage repair round"
            );

            let batches = batch_by_file(catalog, &uncovered);
            let mut raw_outputs: Vec<String> = Vec::new();
            let mut staged: Vec<RepairDelta> = Vec::new();
            let mut claimed: Vec<String> = Vec::new();

            for (batch_idx, batch) in batches.iter().enumerate() {
                self.check_cancelled()?;
                let scope = format!("repair_{round}/p3_batch_{batch_idx}");
                let prompt = prompts::p3_repair_batch(
                    &state.overview(),
                    &batch.join("\n"),
                    &state.next_group_id(),
                    &state.next_flow_id(),
                    3,
                );
                match self.call(&scope, &prompt).await {
                    Ok(text) => {
                        if let Some(delta) = extract_json_object(&text)
                            .and_then(|v| serde_json::from_value::<RepairDelta>(v).ok())
                        {
                            claimed.extend(
                                delta.new_flows.iter().flat_map(|f| f.function_refs.clone()),
                            );
                            staged.push(delta);
                        }
                        raw_outputs.push(text);
                    }
                    Err(AuditError::Cancelled) => return Err(AuditError::Cancelled),
                    Err(e) => {
                        warn!(scope = %scope, error = %e, "repair batch failed, continuing");
                        report.partial = true;
                    }
                }
            }

            let residual: Vec<String> = uncovered
                .iter()
                .map(|&idx| catalog.get(idx).signed_name())
                .filter(|name| !claimed.contains(name))
                .collect();
            if !residual.is_empty() && !raw_outputs.is_empty() {
                let scope = format!("repair_{round}/p4");
                let prompt =
                    prompts::p4_repair_incremental(&raw_outputs.join("\n\n"), &residual.join("\n"));
                match self.call(&scope, &prompt).await {
                    Ok(text) => raw_outputs.push(text),
                    Err(AuditError::Cancelled) => return Err(AuditError::Cancelled),
                    Err(e) => {
                        warn!(scope = %scope, error = %e, "P4 pass failed, continuing");
                        report.partial = true;
                    }
                }
            }

            if raw_outputs.is_empty() {
                // Every batch failed; another identical round would too.
                report.partial = true;
                break;
            }

            let p5_prompt = prompts::p5_repair_final_json(
                &raw_outputs.join("\n\n"),
                &state.next_group_id(),
                &state.next_flow_id(),
            );
            let scope = format!("repair_{round}/p5");
            let delta = match self.call_for_json(&p5_prompt, &scope).await? {
                Some(value) => serde_json::from_value::<RepairDelta>(value).ok(),
                None => None,
            };

            match delta {
                Some(delta) => state.merge_delta(delta),
                None => {
                    // Fall back to the per-batch deltas that did parse.
                    warn!("P5 convergence failed twice, merging parsed batch deltas");
                    report.partial = true;
                    if staged.is_empty() {
                        break;
                    }
                    for delta in staged {
                        state.merge_delta(delta);
                    }
                }
            }
        }
        Ok(())
    }

    /// Emit one task per (flow × rule key). Flows with no matched refs carry
    /// no scannable code and are dropped.
    fn finalize_tasks(&self, catalog: &FunctionCatalog, resolved: &[ResolvedFlow]) -> Vec<Task> {
        let mut tasks = Vec::new();
        for r in resolved {
            if r.matched.is_empty() {
                warn!(flow_id = %r.flow.flow_id, "flow has no resolvable refs, skipping");
                continue;
            }
            let business_flow_code: String = r
                .matched
                .iter()
                .map(|&idx| catalog.get(idx).content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");
            let entry = catalog.get(r.matched[0]);

            for rule_key in &self.config.rule_keys {
                let rule = json!({
                    "flow_id": r.flow.flow_id,
                    "flow_name": r.flow.flow_name,
                    "group_ids": r.flow.group_ids,
                    "function_refs": r.matched_refs,
                    "missing_function_refs": r.missing_refs,
                    "ambiguous_function_refs": r.ambiguous_refs,
                    "planning_stage": "finalize",
                    "rule_key": rule_key,
                    "checklist": self.config.checklist_for(rule_key),
                });

                let mut task = Task::new(
                    &self.project_id,
                    format!("Fi:{} {} [{}]", r.flow.flow_id, r.flow.flow_name, rule_key),
                );
                task.content = entry.content.clone();
                task.rule = rule.to_string();
                task.rule_key = rule_key.clone();
                task.start_line = entry.start_line.to_string();
                task.end_line = entry.end_line.to_string();
                task.relative_file_path = entry.relative_file_path.clone();
                task.absolute_file_path = entry.absolute_file_path.clone();
                task.business_flow_code = business_flow_code.clone();
                task.group = r.flow.flow_id.clone();
                tasks.push(task);
            }
        }
        tasks
    }

    /// One planning agent call; planning is always read-only.
    async fn call(&self, scope: &str, prompt: &str) -> Result<String> {
        self.check_cancelled()?;
        let request = AgentRequest::new(
            "plan",
            &self.project_id,
            scope,
            &self.workspace_root,
            prompt,
        )
        .with_cancel(self.cancel.clone());

        match self.invoker.run(request).await? {
            ExecOutcome::Completed(output) => Ok(output.stdout),
            ExecOutcome::Failed(output) => Err(AuditError::Exec(format!(
                "planning call {scope} exited {:?}: {}",
                output.exit_code,
                truncate(&output.stderr, 400)
            ))),
            ExecOutcome::Timeout(_) => Err(AuditError::Timeout {
                timeout_sec: self.config.agent.timeout_sec,
            }),
        }
    }

    /// Convergence call with one strict-reminder retry.
    async fn call_for_json(
        &self,
        prompt: &str,
        scope: &str,
    ) -> Result<Option<serde_json::Value>> {
        let first = self.call(scope, prompt).await?;
        if let Some(value) = extract_json_object(&first) {
            return Ok(Some(value));
        }
        let retry_scope = format!("{scope}_retry");
        let retry_prompt = format!("{prompt}\n\n{}", prompts::json_retry_reminder(&first));
        let second = self.call(&retry_scope, &retry_prompt).await?;
        Ok(extract_json_object(&second))
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(AuditError::Cancelled);
        }
        Ok(())
    }
}

/// Partition uncovered entries into per-file batches, then chunk large files.
/// Batch size scales with catalog size within 150–400.
fn batch_by_file(catalog: &FunctionCatalog, uncovered: &[usize]) -> Vec<Vec<String>> {
    let batch_size = (catalog.len() / 10).clamp(150, 400);

    let mut by_file: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for &idx in uncovered {
        let entry = catalog.get(idx);
        by_file
            .entry(entry.relative_file_path.as_str())
            .or_default()
            .push(entry.signed_name());
    }

    let mut batches = Vec::new();
    let mut current: Vec<String> = Vec::new();
    for (_, names) in by_file {
        for name in names {
            current.push(name);
            if current.len() >= batch_size {
                batches.push(std::mem::take(&mut current));
            }
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

fn store_err(e: anyhow::Error) -> AuditError {
    AuditError::Store(format!("{e:#}"))
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FunctionEntry;

    fn entry(name: &str, file: &str, line: u32) -> FunctionEntry {
        FunctionEntry {
            name: name.to_string(),
            signature: None,
            visibility: "public".to_string(),
            content: format!("body({name})"),
            start_line: line,
            end_line: line + 5,
            relative_file_path: file.to_string(),
            absolute_file_path: format!("/abs/{file}"),
        }
    }

    #[test]
    fn batches_group_by_file_and_respect_cap() {
        let mut entries = Vec::new();
        for i in 0..10 {
            entries.push(entry(&format!("A.f{i}"), "a.sol", i * 10 + 1));
        }
        for i in 0..5 {
            entries.push(entry(&format!("B.g{i}"), "b.sol", i * 10 + 1));
        }
        let catalog = FunctionCatalog::from_entries(entries);
        let uncovered: Vec<usize> = (0..catalog.len()).collect();

        let batches = batch_by_file(&catalog, &uncovered);
        // Small catalog: minimum batch size applies, everything fits in one.
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 15);
        // File `a.sol` names come before `b.sol` names.
        assert!(batches[0][0].starts_with("A."));
        assert!(batches[0][14].starts_with("B."));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "日本語テキスト";
        let t = truncate(s, 4);
        assert!(s.starts_with(t));
        assert!(t.len() <= 4);
    }
}
