//! Reasoning stage: bounded multi-round vulnerability mining per task.
//!
//! Tasks sharing a `group` (one business flow) run serially in insertion
//! order; distinct groups run in parallel up to the configured limit. The
//! per-task state machine is INIT → REASON → SPLIT → (EVAL → (PIVOT_IDEATE →
//! REASON) | STOP) → DONE, with resume decided from `result`/`short_result`.

pub mod prompts;
pub mod trace;
pub mod watcher;

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{output::extract_json_object, AgentInvoker, AgentRequest, ExecOutcome};
use crate::config::{AuditConfig, SandboxMode};
use crate::error::{AuditError, Result};
use crate::store::{self, Finding, FindingRepository, ShortResult, Task, TaskRepository};

use trace::{RoundRecord, ScanRecord};
use watcher::{WatcherDecision, WatcherState};

/// Outcome summary of one reasoning run.
#[derive(Debug, Clone, Default)]
pub struct ReasoningReport {
    pub tasks_total: usize,
    pub tasks_processed: usize,
    pub tasks_skipped: usize,
    pub findings_written: usize,
    pub errors: usize,
}

#[derive(Debug)]
enum TaskOutcome {
    Skipped,
    Processed { findings: usize },
    /// Raw unparseable output stored in `result`; split deferred to a re-run.
    MalformedStored,
    SplitFailed,
}

#[derive(Clone)]
pub struct ReasoningLoop {
    config: AuditConfig,
    invoker: Arc<dyn AgentInvoker>,
    tasks: TaskRepository,
    findings: FindingRepository,
    project_id: String,
    workspace_root: PathBuf,
    cancel: CancellationToken,
}

impl ReasoningLoop {
    pub fn new(
        config: AuditConfig,
        invoker: Arc<dyn AgentInvoker>,
        tasks: TaskRepository,
        findings: FindingRepository,
        project_id: impl Into<String>,
        workspace_root: PathBuf,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            invoker,
            tasks,
            findings,
            project_id: project_id.into(),
            workspace_root,
            cancel,
        }
    }

    /// Run reasoning over every task of the project.
    pub async fn run(&self) -> Result<ReasoningReport> {
        let all = store::with_retry(|| self.tasks.tasks_by_project(&self.project_id))
            .map_err(|e| AuditError::Store(format!("{e:#}")))?;
        let mut report = ReasoningReport {
            tasks_total: all.len(),
            ..Default::default()
        };
        if all.is_empty() {
            return Ok(report);
        }

        // Group tasks by flow, preserving insertion order inside and across
        // groups. Tasks without a group share one serial bucket.
        let mut groups: Vec<(String, Vec<Task>)> = Vec::new();
        for task in all {
            let key = if task.group.is_empty() {
                "no_group".to_string()
            } else {
                task.group.clone()
            };
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, bucket)) => bucket.push(task),
                None => groups.push((key, vec![task])),
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.config.reasoning.max_parallel.max(1)));
        let mut handles = Vec::new();
        for (group_key, bucket) in groups {
            let this = self.clone();
            let semaphore = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return ReasoningReport::default(),
                };
                this.process_group(&group_key, bucket).await
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(partial) => {
                    report.tasks_processed += partial.tasks_processed;
                    report.tasks_skipped += partial.tasks_skipped;
                    report.findings_written += partial.findings_written;
                    report.errors += partial.errors;
                }
                Err(e) => {
                    warn!(error = %e, "reasoning group worker panicked");
                    report.errors += 1;
                }
            }
        }

        if self.cancel.is_cancelled() {
            return Err(AuditError::Cancelled);
        }
        info!(
            project_id = %self.project_id,
            processed = report.tasks_processed,
            skipped = report.tasks_skipped,
            findings = report.findings_written,
            errors = report.errors,
            "reasoning finished"
        );
        Ok(report)
    }

    /// Serially process one group's tasks.
    async fn process_group(&self, group_key: &str, bucket: Vec<Task>) -> ReasoningReport {
        let mut report = ReasoningReport::default();
        for task in bucket {
            if self.cancel.is_cancelled() {
                break;
            }
            let name = task.name.clone();
            match self.process_task(task).await {
                Ok(TaskOutcome::Skipped) => report.tasks_skipped += 1,
                Ok(TaskOutcome::Processed { findings }) => {
                    report.tasks_processed += 1;
                    report.findings_written += findings;
                }
                Ok(TaskOutcome::MalformedStored) => {
                    report.tasks_processed += 1;
                    report.errors += 1;
                }
                Ok(TaskOutcome::SplitFailed) => {
                    report.tasks_processed += 1;
                    report.errors += 1;
                }
                Err(AuditError::Cancelled) => break,
                Err(e) => {
                    warn!(group = group_key, task = %name, error = %e, "task failed");
                    report.errors += 1;
                }
            }
            tokio::task::yield_now().await;
        }
        report
    }

    async fn process_task(&self, task: Task) -> Result<TaskOutcome> {
        // Resume semantics.
        if task.short_result == ShortResult::SplitDone {
            debug!(task = %task.name, "already split, skipping");
            return Ok(TaskOutcome::Skipped);
        }
        if task.has_result() {
            // Reasoning already ran; only the split is owed — unless the
            // stored result is raw unparseable text, which means the last
            // round was malformed and reasoning must re-run.
            if let Ok(value) = serde_json::from_str::<Value>(&task.result) {
                if value.get("vulnerabilities").map(|v| v.is_array()).unwrap_or(false) {
                    info!(task = %task.name, "re-running deferred split");
                    return self.split(&task, &value);
                }
            }
        }

        let aggregated = self.reason(&task).await?;
        match aggregated {
            Some(value) => {
                store::with_retry(|| {
                    self.tasks.update_task_result(task.id, &value.to_string())
                })
                .map_err(|e| AuditError::Store(format!("{e:#}")))?;
                self.split(&task, &value)
            }
            None => Ok(TaskOutcome::MalformedStored),
        }
    }

    /// The REASON/EVAL/PIVOT loop. Returns the aggregated result, or `None`
    /// when no round produced parseable JSON (the raw text is stored on the
    /// task for a later re-attempt).
    async fn reason(&self, task: &Task) -> Result<Option<Value>> {
        if task.business_flow_code.trim().is_empty() {
            return Err(AuditError::PromptAssembly(format!(
                "task {} has no business flow code",
                task.name
            )));
        }
        let rule_key = task.rule_key.as_str();
        let checklist = checklist_from_rule(&task.rule)
            .unwrap_or_else(|| self.config.checklist_for(rule_key));
        let sandbox = if self.config.agent.poc_execution {
            SandboxMode::WorkspaceWrite
        } else {
            SandboxMode::ReadOnly
        };

        let mut watcher = WatcherState::new(
            self.config.reasoning.max_rounds,
            self.config.agent.timeout_sec,
        );
        let mut record = ScanRecord::new(&self.project_id, task.id, &task.uuid, rule_key);
        let mut instruction = watcher.initial_instruction(rule_key);
        let mut aggregated: Vec<Value> = Vec::new();
        let mut parsed_any = false;
        let mut last_raw: Option<String> = None;
        let mut round = 1u32;

        loop {
            if self.cancel.is_cancelled() {
                self.persist_trace(task, &record);
                return Err(AuditError::Cancelled);
            }

            let prompt = prompts::reasoner(&task.business_flow_code, rule_key, &checklist, &instruction);
            let request = AgentRequest::new(
                "reason",
                &self.project_id,
                format!("task_{}/round_{round}", task.uuid),
                &self.workspace_root,
                prompt,
            )
            .with_sandbox(sandbox)
            .with_cancel(self.cancel.clone());

            let started_at = chrono::Utc::now().timestamp_millis();
            let round_result = self.invoker.run(request).await;

            let (exit_mode, artifact_dir, items) = match round_result {
                Ok(ExecOutcome::Completed(output)) => {
                    match extract_json_object(&output.stdout)
                        .filter(|v| v.get("vulnerabilities").map(|x| x.is_array()).unwrap_or(false))
                    {
                        Some(value) => {
                            parsed_any = true;
                            let items = vulnerability_items(&value);
                            ("ok", Some(output.artifact_dir), items)
                        }
                        None => {
                            last_raw = Some(output.stdout.clone());
                            ("parse_error", Some(output.artifact_dir), Vec::new())
                        }
                    }
                }
                Ok(ExecOutcome::Failed(output)) => ("error", Some(output.artifact_dir), Vec::new()),
                Ok(ExecOutcome::Timeout(output)) => ("timeout", Some(output.artifact_dir), Vec::new()),
                Err(AuditError::Cancelled) => {
                    self.persist_trace(task, &record);
                    return Err(AuditError::Cancelled);
                }
                // Spawn-level failure is a per-round failure too.
                Err(_) => ("error", None, Vec::new()),
            };

            let mut fresh = 0usize;
            for (description, obj) in items {
                if watcher.record_descriptions(&[description]) == 1 {
                    aggregated.push(obj);
                    fresh += 1;
                }
            }

            let (decision, reason) = watcher.evaluate(fresh, &instruction);
            record.push(RoundRecord {
                round,
                role: "reasoner".to_string(),
                artifact_dir: artifact_dir.map(|p| p.display().to_string()),
                exit_mode: exit_mode.to_string(),
                new_findings: fresh,
                decision: Some(decision.as_str().to_string()),
                decision_reason: Some(reason),
                watcher_instruction: Some(instruction.clone()),
                budget_next: Some(watcher.budget_snapshot()),
                started_at,
                finished_at: chrono::Utc::now().timestamp_millis(),
            });

            match decision {
                WatcherDecision::Stop => break,
                WatcherDecision::Continue => {
                    round += 1;
                    instruction = watcher.continue_instruction(round, rule_key);
                }
                WatcherDecision::Pivot => {
                    let probes = self
                        .ideate(task, &mut watcher, &mut record, &instruction, round)
                        .await?;
                    round += 1;
                    instruction = watcher.pivot_instruction(round, rule_key, &probes);
                }
            }
            tokio::task::yield_now().await;
        }

        self.persist_trace(task, &record);

        if !parsed_any {
            if let Some(raw) = last_raw {
                // Boundary case: malformed output only. Store the raw text
                // so the next run re-attempts the task.
                store::with_retry(|| self.tasks.update_task_result(task.id, &raw))
                    .map_err(|e| AuditError::Store(format!("{e:#}")))?;
                return Ok(None);
            }
            if aggregated.is_empty() && watcher.seen_count() == 0 {
                // Every round failed outright; leave the task untouched for
                // a clean re-run.
                return Err(AuditError::Exec(
                    "all reasoning rounds failed without output".to_string(),
                ));
            }
        }

        Ok(Some(json!({
            "schema_version": "1.0",
            "vulnerabilities": aggregated,
        })))
    }

    /// PIVOT_IDEATE: one Ideator call; its probes feed the next instruction.
    async fn ideate(
        &self,
        task: &Task,
        watcher: &mut WatcherState,
        record: &mut ScanRecord,
        last_instruction: &str,
        round: u32,
    ) -> Result<Vec<String>> {
        let confirmed = watcher.seen_descriptions();
        let prompt = prompts::ideator(
            &task.rule_key,
            last_instruction,
            &confirmed,
            watcher.remaining_rounds(),
        );
        let request = AgentRequest::new(
            "reason",
            &self.project_id,
            format!("task_{}/ideate_{round}", task.uuid),
            &self.workspace_root,
            prompt,
        )
        .with_cancel(self.cancel.clone());

        let started_at = chrono::Utc::now().timestamp_millis();
        let mut probes = Vec::new();
        let (exit_mode, artifact_dir) = match self.invoker.run(request).await {
            Ok(ExecOutcome::Completed(output)) => {
                if let Some(value) = extract_json_object(&output.stdout) {
                    let hypotheses = string_list(&value, "new_hypotheses");
                    probes = string_list(&value, "suggested_probes");
                    if probes.is_empty() {
                        probes = hypotheses.clone();
                    }
                    watcher.add_hypotheses(hypotheses.len().max(probes.len()));
                    ("ok", Some(output.artifact_dir))
                } else {
                    ("parse_error", Some(output.artifact_dir))
                }
            }
            Ok(ExecOutcome::Failed(output)) => ("error", Some(output.artifact_dir)),
            Ok(ExecOutcome::Timeout(output)) => ("timeout", Some(output.artifact_dir)),
            Err(AuditError::Cancelled) => return Err(AuditError::Cancelled),
            Err(_) => ("error", None),
        };

        record.push(RoundRecord {
            round,
            role: "ideator".to_string(),
            artifact_dir: artifact_dir.map(|p| p.display().to_string()),
            exit_mode: exit_mode.to_string(),
            new_findings: 0,
            decision: None,
            decision_reason: None,
            watcher_instruction: None,
            budget_next: Some(watcher.budget_snapshot()),
            started_at,
            finished_at: chrono::Utc::now().timestamp_millis(),
        });
        Ok(probes)
    }

    /// SPLIT: idempotently replace the task's findings with the parsed
    /// result. `result` was written first, so a crash mid-split leaves a
    /// recoverable state.
    fn split(&self, task: &Task, value: &Value) -> Result<TaskOutcome> {
        let schema_version = value
            .get("schema_version")
            .and_then(|v| v.as_str())
            .unwrap_or("1.0")
            .to_string();
        let vulns = value
            .get("vulnerabilities")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let rows: Vec<Finding> = vulns
            .iter()
            .map(|vuln| {
                let single = json!({
                    "schema_version": schema_version,
                    "vulnerabilities": [normalize_vulnerability(vuln)],
                });
                Finding::from_task(task, single.to_string())
            })
            .collect();

        let written = store::with_retry(|| self.findings.replace_task_findings(task.id, &rows));
        match written {
            Ok(count) => {
                store::with_retry(|| {
                    self.tasks.set_task_short_result(task.id, ShortResult::SplitDone)
                })
                .map_err(|e| AuditError::Store(format!("{e:#}")))?;
                Ok(TaskOutcome::Processed { findings: count })
            }
            Err(e) => {
                warn!(task = %task.name, error = %e, "split failed");
                let _ = self
                    .tasks
                    .set_task_short_result(task.id, ShortResult::SplitFailed);
                Ok(TaskOutcome::SplitFailed)
            }
        }
    }

    fn persist_trace(&self, task: &Task, record: &ScanRecord) {
        if let Err(e) =
            store::with_retry(|| self.tasks.update_task_scan_record(task.id, &record.to_json()))
        {
            warn!(task = %task.name, error = %e, "failed to persist scan record");
        }
    }
}

/// Planning stored the checklist inside `Task.rule`; prefer it over the
/// config table so a task stays self-describing.
fn checklist_from_rule(rule: &str) -> Option<Vec<String>> {
    let value: Value = serde_json::from_str(rule).ok()?;
    let items = value.get("checklist")?.as_array()?;
    Some(
        items
            .iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect(),
    )
}

/// Normalize one reasoner vulnerability entry to an object with a
/// `description` (bare strings and shapeless objects are tolerated).
fn normalize_vulnerability(vuln: &Value) -> Value {
    match vuln {
        Value::String(s) => json!({ "description": s }),
        Value::Object(map) => {
            if map.contains_key("description") {
                vuln.clone()
            } else {
                json!({ "description": vuln.to_string() })
            }
        }
        other => json!({ "description": other.to_string() }),
    }
}

/// Extract `(description, normalized object)` pairs from a parsed round.
fn vulnerability_items(value: &Value) -> Vec<(String, Value)> {
    value
        .get("vulnerabilities")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .map(|vuln| {
                    let normalized = normalize_vulnerability(vuln);
                    let description = normalized["description"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string();
                    (description, normalized)
                })
                .collect()
        })
        .unwrap_or_default()
}

fn string_list(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_string_and_object_vulnerabilities() {
        let s = normalize_vulnerability(&json!("reentrancy in withdraw"));
        assert_eq!(s["description"], "reentrancy in withdraw");

        let with_desc = normalize_vulnerability(&json!({"description": "D", "extra": 1}));
        assert_eq!(with_desc["extra"], 1);

        let shapeless = normalize_vulnerability(&json!({"impact": "high"}));
        assert!(shapeless["description"].as_str().unwrap().contains("impact"));
    }

    #[test]
    fn items_come_back_in_order() {
        let value = json!({
            "schema_version": "1.0",
            "vulnerabilities": [{"description": "D1"}, "D2"]
        });
        let items = vulnerability_items(&value);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].0, "D1");
        assert_eq!(items[1].0, "D2");
    }

    #[test]
    fn checklist_prefers_rule_payload() {
        let rule = json!({
            "flow_id": "F1",
            "checklist": ["item a", "item b"]
        })
        .to_string();
        assert_eq!(checklist_from_rule(&rule).unwrap(), vec!["item a", "item b"]);
        assert!(checklist_from_rule("not json").is_none());
    }
}
