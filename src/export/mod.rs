//! Report export: confirmed findings to markdown, kept findings to JSON.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::json;

use crate::store::{Finding, FindingRepository};

/// Paths written by one export run.
#[derive(Debug, Clone)]
pub struct ExportPaths {
    pub markdown: PathBuf,
    pub json: PathBuf,
    pub confirmed: usize,
}

/// Write `report_<project_id>.md` (confirmed vulnerabilities) and
/// `findings_<project_id>.json` (every kept finding) into `output_dir`.
pub fn export_project(
    findings: &FindingRepository,
    project_id: &str,
    output_dir: &Path,
) -> Result<ExportPaths> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;

    let confirmed = findings.list_findings_for_export(project_id)?;
    let kept = findings.list_kept_findings(project_id)?;

    let markdown_path = output_dir.join(format!("report_{project_id}.md"));
    std::fs::write(&markdown_path, render_markdown(project_id, &confirmed))
        .with_context(|| format!("Failed to write {}", markdown_path.display()))?;

    let json_path = output_dir.join(format!("findings_{project_id}.json"));
    let dump: Vec<_> = kept.iter().map(finding_to_json).collect();
    std::fs::write(&json_path, serde_json::to_string_pretty(&dump)?)
        .with_context(|| format!("Failed to write {}", json_path.display()))?;

    Ok(ExportPaths {
        markdown: markdown_path,
        json: json_path,
        confirmed: confirmed.len(),
    })
}

fn render_markdown(project_id: &str, confirmed: &[Finding]) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Audit report — {project_id}\n\n"));
    out.push_str(&format!(
        "Confirmed vulnerabilities: {}\n\n",
        confirmed.len()
    ));

    for (idx, finding) in confirmed.iter().enumerate() {
        out.push_str(&format!(
            "## Finding {}: {}\n\n",
            idx + 1,
            finding.task_name
        ));
        out.push_str(&format!("- **Finding UUID**: {}\n", finding.uuid));
        out.push_str(&format!("- **Rule key**: {}\n", finding.rule_key));
        if !finding.task_relative_file_path.is_empty() {
            out.push_str(&format!(
                "- **Location**: {} (lines {}-{})\n",
                finding.task_relative_file_path, finding.task_start_line, finding.task_end_line
            ));
        }
        out.push('\n');

        if let Some(description) = finding.description() {
            out.push_str("### Description\n\n");
            out.push_str(&description);
            out.push_str("\n\n");
        }

        if !finding.task_business_flow_code.is_empty() {
            out.push_str("### Business flow code\n\n```\n");
            out.push_str(&finding.task_business_flow_code);
            out.push_str("\n```\n\n");
        }

        if !finding.validation_record.is_empty() {
            if let Ok(record) = serde_json::from_str::<serde_json::Value>(&finding.validation_record)
            {
                if let Some(reason) = record["parsed"]["reason"].as_str() {
                    out.push_str("### Validation\n\n");
                    out.push_str(reason);
                    out.push_str("\n\n");
                }
            }
        }
        out.push_str("---\n\n");
    }
    out
}

fn finding_to_json(finding: &Finding) -> serde_json::Value {
    json!({
        "uuid": finding.uuid,
        "project_id": finding.project_id,
        "task_id": finding.task_id,
        "task_uuid": finding.task_uuid,
        "task_name": finding.task_name,
        "rule_key": finding.rule_key,
        "finding_json": serde_json::from_str::<serde_json::Value>(&finding.finding_json)
            .unwrap_or(serde_json::Value::Null),
        "relative_file_path": finding.task_relative_file_path,
        "start_line": finding.task_start_line,
        "end_line": finding.task_end_line,
        "dedup_status": finding.dedup_status.as_str(),
        "validation_status": finding.validation_status.map(|s| s.as_str()),
        "validation_record": serde_json::from_str::<serde_json::Value>(&finding.validation_record)
            .unwrap_or(serde_json::Value::Null),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AuditDb, Task, TaskRepository, ValidationStatus};
    use tempfile::tempdir;

    #[test]
    fn export_writes_report_and_dump() {
        let db = AuditDb::open_in_memory().unwrap();
        let tasks = TaskRepository::new(db.clone());
        let findings = FindingRepository::new(db);

        let mut task = Task::new("p1", "Fi:F1 trade [asset_flow]");
        task.rule_key = "asset_flow".to_string();
        task.relative_file_path = "src/Vault.sol".to_string();
        task.id = tasks.insert_task(&task).unwrap();

        let row = crate::store::Finding::from_task(
            &task,
            r#"{"schema_version":"1.0","vulnerabilities":[{"description":"Fee rounding drains vault"}]}"#
                .to_string(),
        );
        findings.replace_task_findings(task.id, &[row]).unwrap();
        let stored = findings.list_findings_by_task(task.id).unwrap();
        findings
            .update_finding_validation(stored[0].id, ValidationStatus::Vulnerability, "{}")
            .unwrap();

        let dir = tempdir().unwrap();
        let paths = export_project(&findings, "p1", dir.path()).unwrap();
        assert_eq!(paths.confirmed, 1);

        let markdown = std::fs::read_to_string(&paths.markdown).unwrap();
        assert!(markdown.contains("Fee rounding drains vault"));
        assert!(markdown.contains("Confirmed vulnerabilities: 1"));

        let dump: Vec<serde_json::Value> =
            serde_json::from_str(&std::fs::read_to_string(&paths.json).unwrap()).unwrap();
        assert_eq!(dump.len(), 1);
        assert_eq!(dump[0]["validation_status"], "vulnerability");
    }
}
