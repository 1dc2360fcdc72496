//! Reasoning trace persisted into `project_task.scan_record`.
//!
//! The trace references agent artifact directories instead of duplicating
//! stdout/stderr into the database; any round can be replayed from it.

use serde::{Deserialize, Serialize};

pub const TRACE_SCHEMA_VERSION: &str = "reasoning_trace_v1";

/// Budget snapshot the Watcher emits with each decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub max_more_rounds: u32,
    pub time_limit_sec: u64,
    pub no_progress_rounds: u32,
}

/// One per-round record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundRecord {
    pub round: u32,
    /// `reasoner` or `ideator`.
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_dir: Option<String>,
    /// `ok | error | timeout | parse_error`.
    pub exit_mode: String,
    pub new_findings: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watcher_instruction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_next: Option<BudgetSnapshot>,
    pub started_at: i64,
    pub finished_at: i64,
}

/// The full `scan_record` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRecord {
    pub schema_version: String,
    pub project_id: String,
    pub task_id: i64,
    pub task_uuid: String,
    pub rule_key: String,
    pub rounds: Vec<RoundRecord>,
}

impl ScanRecord {
    pub fn new(project_id: &str, task_id: i64, task_uuid: &str, rule_key: &str) -> Self {
        Self {
            schema_version: TRACE_SCHEMA_VERSION.to_string(),
            project_id: project_id.to_string(),
            task_id,
            task_uuid: task_uuid.to_string(),
            rule_key: rule_key.to_string(),
            rounds: Vec::new(),
        }
    }

    pub fn push(&mut self, record: RoundRecord) {
        self.rounds.push(record);
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_serializes_with_schema_version() {
        let mut trace = ScanRecord::new("p1", 3, "uuid-3", "access_control");
        trace.push(RoundRecord {
            round: 1,
            role: "reasoner".to_string(),
            artifact_dir: Some("logs/reason_p1_x/F1/round_1".to_string()),
            exit_mode: "ok".to_string(),
            new_findings: 2,
            decision: Some("continue".to_string()),
            decision_reason: Some("new findings, budget remains".to_string()),
            watcher_instruction: None,
            budget_next: Some(BudgetSnapshot {
                max_more_rounds: 3,
                time_limit_sec: 1800,
                no_progress_rounds: 0,
            }),
            started_at: 1,
            finished_at: 2,
        });

        let json = trace.to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["schema_version"], TRACE_SCHEMA_VERSION);
        assert_eq!(value["rounds"][0]["new_findings"], 2);
        // Full stdout is never embedded, only the artifact path.
        assert!(json.contains("logs/reason_p1_x"));
    }
}
