//! Validation stage: evidence-based re-check of persisted findings.
//!
//! Selection covers findings not dedup-deleted whose validation status is
//! still empty or pending. Each check is one read-only agent invocation in
//! the finding's project workspace; the verdict maps into the closed status
//! enum and a full audit record lands in `validation_record`.

pub mod prompt;

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{output::extract_json_object, AgentInvoker, AgentRequest, ExecOutcome};
use crate::config::AuditConfig;
use crate::error::{AuditError, Result};
use crate::store::{self, Finding, FindingRepository, ValidationStatus};

/// Outcome summary of one validation run.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub findings_selected: usize,
    pub validated: usize,
    pub errors: usize,
}

#[derive(Clone)]
pub struct Validator {
    config: AuditConfig,
    invoker: Arc<dyn AgentInvoker>,
    findings: FindingRepository,
    project_id: String,
    workspace_root: PathBuf,
    cancel: CancellationToken,
}

impl Validator {
    pub fn new(
        config: AuditConfig,
        invoker: Arc<dyn AgentInvoker>,
        findings: FindingRepository,
        project_id: impl Into<String>,
        workspace_root: PathBuf,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            invoker,
            findings,
            project_id: project_id.into(),
            workspace_root,
            cancel,
        }
    }

    pub async fn run(&self) -> Result<ValidationReport> {
        let mut pending = store::with_retry(|| {
            self.findings.list_findings_for_validation(&self.project_id)
        })
        .map_err(|e| AuditError::Store(format!("{e:#}")))?;

        // Canary cap for test runs.
        let cap = self.config.validation.max_findings;
        if cap > 0 && pending.len() > cap {
            pending.truncate(cap);
        }

        let mut report = ValidationReport {
            findings_selected: pending.len(),
            ..Default::default()
        };
        info!(
            project_id = %self.project_id,
            selected = pending.len(),
            "validation selection"
        );
        if pending.is_empty() {
            return Ok(report);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.validation.max_parallel.max(1)));
        let mut handles = Vec::new();
        for finding in pending {
            let this = self.clone();
            let semaphore = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return false,
                };
                if this.cancel.is_cancelled() {
                    return false;
                }
                this.validate_one(&finding).await
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(true) => report.validated += 1,
                Ok(false) => report.errors += 1,
                Err(e) => {
                    warn!(error = %e, "validation worker panicked");
                    report.errors += 1;
                }
            }
        }

        if self.cancel.is_cancelled() {
            return Err(AuditError::Cancelled);
        }
        info!(
            project_id = %self.project_id,
            validated = report.validated,
            errors = report.errors,
            "validation finished"
        );
        Ok(report)
    }

    /// Validate one finding. Returns `false` when the verdict is an
    /// infrastructure `error`; the worker then moves on to the next finding.
    async fn validate_one(&self, finding: &Finding) -> bool {
        // Re-running on a finalized finding is a no-op.
        if finding
            .validation_status
            .map(|s| s.is_final())
            .unwrap_or(false)
        {
            return true;
        }

        let prompt = prompt::build_validation_prompt(
            &finding.finding_json,
            &finding.rule_key,
            &finding.task_relative_file_path,
            &finding.task_name,
        );
        let prompt_hash = fnv1a64_hex(prompt.as_bytes());
        let started_at = chrono::Utc::now().timestamp_millis();

        let mut record = json!({
            "schema_version": "validation_codex_v1",
            "workspace_root": self.workspace_root.display().to_string(),
            "sandbox": "read-only",
            "prompt_hash": prompt_hash,
            "started_at": started_at,
        });

        let mut request = AgentRequest::new(
            "validate",
            &self.project_id,
            format!("finding_{}", finding.uuid),
            &self.workspace_root,
            prompt,
        )
        .with_cancel(self.cancel.clone());
        if let Some(timeout_sec) = self.config.validation.timeout_sec {
            request = request.with_timeout(timeout_sec);
        }

        let (status, ok) = match self.invoker.run(request).await {
            Ok(ExecOutcome::Completed(output)) => {
                record["exit_mode"] = json!("ok");
                record["exit_code"] = json!(output.exit_code);
                record["raw_final_text"] = json!(output.stdout);
                record["artifact_dir"] = json!(output.artifact_dir.display().to_string());
                match parse_verdict(&output.stdout) {
                    Ok(parsed) => {
                        let status = parsed.status;
                        record["parsed"] = parsed.object;
                        (status, true)
                    }
                    Err(parse_error) => {
                        record["parse_error"] = json!(parse_error);
                        (ValidationStatus::NotSure, true)
                    }
                }
            }
            Ok(ExecOutcome::Failed(output)) => {
                record["exit_mode"] = json!("error");
                record["exit_code"] = json!(output.exit_code);
                record["raw_final_text"] = json!(output.stdout);
                record["stderr"] = json!(output.stderr);
                record["artifact_dir"] = json!(output.artifact_dir.display().to_string());
                (ValidationStatus::Error, false)
            }
            Ok(ExecOutcome::Timeout(output)) => {
                record["exit_mode"] = json!("timeout");
                record["raw_final_text"] = json!(output.stdout);
                record["artifact_dir"] = json!(output.artifact_dir.display().to_string());
                (ValidationStatus::Error, false)
            }
            Err(AuditError::Cancelled) => return false,
            Err(e) => {
                record["exit_mode"] = json!("error");
                record["error"] = json!(e.to_string());
                (ValidationStatus::Error, false)
            }
        };

        let finished_at = chrono::Utc::now().timestamp_millis();
        record["finished_at"] = json!(finished_at);
        record["duration_ms"] = json!(finished_at - started_at);

        let persisted = store::with_retry(|| {
            self.findings
                .update_finding_validation(finding.id, status, &record.to_string())
        });
        if let Err(e) = persisted {
            warn!(finding_id = finding.id, error = %e, "failed to persist validation");
            return false;
        }
        ok
    }
}

struct Verdict {
    status: ValidationStatus,
    object: Value,
}

/// Parse the agent's single JSON object and map its status into the closed
/// enum. Unknown or missing statuses degrade to `not_sure`.
fn parse_verdict(stdout: &str) -> std::result::Result<Verdict, String> {
    let object = extract_json_object(stdout).ok_or("no_json_object_found")?;
    let status_text = object
        .get("status")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string();
    let status = match ValidationStatus::from_str(&status_text) {
        // The agent never decides `error`; that word from the model means
        // it failed to follow the schema.
        Some(ValidationStatus::Error) | None => ValidationStatus::NotSure,
        Some(status) => status,
    };
    Ok(Verdict { status, object })
}

/// 64-bit FNV-1a, hex-encoded. Ties a validation record to its prompt; not
/// a security boundary.
fn fnv1a64_hex(bytes: &[u8]) -> String {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    format!("{hash:016x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_maps_known_statuses() {
        let v = parse_verdict(r#"{"status": "intended_design", "confidence": "high"}"#).unwrap();
        assert_eq!(v.status, ValidationStatus::IntendedDesign);
        assert_eq!(v.object["confidence"], "high");
    }

    #[test]
    fn unknown_status_degrades_to_not_sure() {
        let v = parse_verdict(r#"{"status": "who_knows"}"#).unwrap();
        assert_eq!(v.status, ValidationStatus::NotSure);
        // A model claiming "error" is a schema violation, not a verdict.
        let v = parse_verdict(r#"{"status": "error"}"#).unwrap();
        assert_eq!(v.status, ValidationStatus::NotSure);
    }

    #[test]
    fn missing_json_is_a_parse_error() {
        assert!(parse_verdict("I could not decide, sorry").is_err());
    }

    #[test]
    fn fnv_hash_is_stable() {
        assert_eq!(fnv1a64_hex(b""), "cbf29ce484222325");
        assert_eq!(fnv1a64_hex(b"audit"), fnv1a64_hex(b"audit"));
        assert_ne!(fnv1a64_hex(b"audit"), fnv1a64_hex(b"audit2"));
    }
}
