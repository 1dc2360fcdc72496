//! Task and Finding models.

use serde::{Deserialize, Serialize};

/// Reasoning completion marker on a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShortResult {
    /// Not yet split (fresh task, or reasoning ran but split did not).
    #[default]
    Empty,
    /// Findings for this task exactly mirror the parsed result.
    SplitDone,
    /// Split attempted and failed; a re-run re-attempts it.
    SplitFailed,
}

impl ShortResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShortResult::Empty => "",
            ShortResult::SplitDone => "split_done",
            ShortResult::SplitFailed => "split_failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "split_done" => ShortResult::SplitDone,
            "split_failed" => ShortResult::SplitFailed,
            _ => ShortResult::Empty,
        }
    }
}

/// Dedup decision on a finding. Empty and `kept` are equivalent for every
/// selection query; only `delete` excludes a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DedupStatus {
    #[default]
    Kept,
    Delete,
}

impl DedupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DedupStatus::Kept => "kept",
            DedupStatus::Delete => "delete",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "delete" => DedupStatus::Delete,
            _ => DedupStatus::Kept,
        }
    }
}

/// Validation verdict on a finding (closed enum).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Pending,
    IntendedDesign,
    FalsePositive,
    Vulnerability,
    VulnHighCost,
    VulnLowImpact,
    NotSure,
    /// Infrastructure failure while validating; never emitted by the agent.
    Error,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStatus::Pending => "pending",
            ValidationStatus::IntendedDesign => "intended_design",
            ValidationStatus::FalsePositive => "false_positive",
            ValidationStatus::Vulnerability => "vulnerability",
            ValidationStatus::VulnHighCost => "vuln_high_cost",
            ValidationStatus::VulnLowImpact => "vuln_low_impact",
            ValidationStatus::NotSure => "not_sure",
            ValidationStatus::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ValidationStatus::Pending),
            "intended_design" => Some(ValidationStatus::IntendedDesign),
            "false_positive" => Some(ValidationStatus::FalsePositive),
            "vulnerability" => Some(ValidationStatus::Vulnerability),
            "vuln_high_cost" => Some(ValidationStatus::VulnHighCost),
            "vuln_low_impact" => Some(ValidationStatus::VulnLowImpact),
            "not_sure" => Some(ValidationStatus::NotSure),
            "error" => Some(ValidationStatus::Error),
            _ => None,
        }
    }

    /// A final status is never re-validated.
    pub fn is_final(&self) -> bool {
        !matches!(self, ValidationStatus::Pending)
    }
}

/// One unit of reasoning work: a business flow bound to a rule key.
#[derive(Debug, Clone, Default)]
pub struct Task {
    pub id: i64,
    pub uuid: String,
    pub project_id: String,
    /// `"Fi:<flow_id> <flow_name> [<rule_key>]"`.
    pub name: String,
    /// Entry function body.
    pub content: String,
    /// Checklist JSON with planning metadata and function refs.
    pub rule: String,
    pub rule_key: String,
    /// Aggregated multi-vulnerability JSON from reasoning ("" until then).
    pub result: String,
    pub contract_code: String,
    pub start_line: String,
    pub end_line: String,
    pub relative_file_path: String,
    pub absolute_file_path: String,
    pub recommendation: String,
    /// Concatenated bodies of the flow's resolved refs, in ref order.
    pub business_flow_code: String,
    /// Reasoning trace JSON.
    pub scan_record: String,
    pub short_result: ShortResult,
    /// Flow id; tasks sharing it execute serially.
    pub group: String,
}

impl Task {
    pub fn new(project_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn has_result(&self) -> bool {
        !self.result.is_empty()
    }
}

/// One single-vulnerability record split out of a task result.
#[derive(Debug, Clone, Default)]
pub struct Finding {
    pub id: i64,
    pub uuid: String,
    pub project_id: String,
    pub task_id: i64,
    pub task_uuid: String,
    pub rule_key: String,
    /// Single-vuln JSON: `{"schema_version":"1.0","vulnerabilities":[{..}]}`
    /// with exactly one element.
    pub finding_json: String,
    pub task_name: String,
    pub task_content: String,
    pub task_business_flow_code: String,
    pub task_contract_code: String,
    pub task_start_line: String,
    pub task_end_line: String,
    pub task_relative_file_path: String,
    pub task_absolute_file_path: String,
    pub task_rule: String,
    pub task_group: String,
    pub dedup_status: DedupStatus,
    pub validation_status: Option<ValidationStatus>,
    pub validation_record: String,
}

impl Finding {
    /// Build a finding from one vulnerability element of a task result,
    /// copying the task's code context so the row is self-contained.
    pub fn from_task(task: &Task, finding_json: String) -> Self {
        Self {
            id: 0,
            uuid: uuid::Uuid::new_v4().to_string(),
            project_id: task.project_id.clone(),
            task_id: task.id,
            task_uuid: task.uuid.clone(),
            rule_key: task.rule_key.clone(),
            finding_json,
            task_name: task.name.clone(),
            task_content: task.content.clone(),
            task_business_flow_code: task.business_flow_code.clone(),
            task_contract_code: task.contract_code.clone(),
            task_start_line: task.start_line.clone(),
            task_end_line: task.end_line.clone(),
            task_relative_file_path: task.relative_file_path.clone(),
            task_absolute_file_path: task.absolute_file_path.clone(),
            task_rule: task.rule.clone(),
            task_group: task.group.clone(),
            dedup_status: DedupStatus::Kept,
            validation_status: Some(ValidationStatus::Pending),
            validation_record: String::new(),
        }
    }

    /// The single vulnerability description inside `finding_json`.
    pub fn description(&self) -> Option<String> {
        let value: serde_json::Value = serde_json::from_str(&self.finding_json).ok()?;
        value["vulnerabilities"][0]["description"]
            .as_str()
            .map(|s| s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_result_round_trip() {
        for v in [ShortResult::Empty, ShortResult::SplitDone, ShortResult::SplitFailed] {
            assert_eq!(ShortResult::from_str(v.as_str()), v);
        }
    }

    #[test]
    fn validation_status_closed_enum() {
        assert_eq!(
            ValidationStatus::from_str("intended_design"),
            Some(ValidationStatus::IntendedDesign)
        );
        assert_eq!(ValidationStatus::from_str("maybe"), None);
        assert!(ValidationStatus::Error.is_final());
        assert!(!ValidationStatus::Pending.is_final());
    }

    #[test]
    fn finding_snapshot_copies_task_context() {
        let mut task = Task::new("proj", "F1:flow trade [access_control]");
        task.id = 7;
        task.business_flow_code = "fn a() {}".to_string();
        task.group = "F1".to_string();
        task.rule_key = "access_control".to_string();

        let finding = Finding::from_task(
            &task,
            r#"{"schema_version":"1.0","vulnerabilities":[{"description":"D1"}]}"#.to_string(),
        );
        assert_eq!(finding.task_id, 7);
        assert_eq!(finding.task_group, "F1");
        assert_eq!(finding.task_business_flow_code, "fn a() {}");
        assert_eq!(finding.description().as_deref(), Some("D1"));
        assert_eq!(finding.validation_status, Some(ValidationStatus::Pending));
    }
}
