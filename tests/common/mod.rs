//! Shared fixtures: a temp dataset with one project and a scripted fake
//! agent binary standing in for the real analysis CLI.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use flowaudit::config::AuditConfig;

/// A dataset base containing one project (`vault`) with a three-function
/// catalog: `A.f`, `A.g`, `B.h`.
pub struct TestDataset {
    pub dir: TempDir,
    pub dataset_base: PathBuf,
    pub workspace_root: PathBuf,
    pub logs_dir: PathBuf,
}

pub const PROJECT_ID: &str = "vault";

pub fn function_body(name: &str) -> String {
    format!("function {name}() {{ /* body of {name} */ }}")
}

impl TestDataset {
    pub fn create() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let dataset_base = dir.path().join("dataset");
        let workspace_root = dataset_base.join("vault-v2");
        let logs_dir = dir.path().join("logs");
        fs::create_dir_all(workspace_root.join(".flowaudit")).unwrap();
        fs::create_dir_all(&logs_dir).unwrap();

        fs::write(
            dataset_base.join("datasets.json"),
            format!(r#"{{"{PROJECT_ID}": {{"path": "vault-v2"}}}}"#),
        )
        .unwrap();

        let functions = serde_json::json!([
            {
                "name": "A.f",
                "visibility": "public",
                "content": function_body("A.f"),
                "start_line": 10,
                "end_line": 20,
                "relative_file_path": "src/A.sol",
                "absolute_file_path": workspace_root.join("src/A.sol").display().to_string(),
            },
            {
                "name": "A.g",
                "visibility": "public",
                "content": function_body("A.g"),
                "start_line": 30,
                "end_line": 40,
                "relative_file_path": "src/A.sol",
                "absolute_file_path": workspace_root.join("src/A.sol").display().to_string(),
            },
            {
                "name": "B.h",
                "visibility": "external",
                "content": function_body("B.h"),
                "start_line": 5,
                "end_line": 15,
                "relative_file_path": "src/B.sol",
                "absolute_file_path": workspace_root.join("src/B.sol").display().to_string(),
            }
        ]);
        fs::write(
            workspace_root.join(".flowaudit/functions.json"),
            serde_json::to_string_pretty(&functions).unwrap(),
        )
        .unwrap();

        Self {
            dir,
            dataset_base,
            workspace_root,
            logs_dir,
        }
    }

    /// Add a second manifest entry whose path escapes the dataset base.
    pub fn add_escaping_project(&self, project_id: &str) {
        let manifest = self.dataset_base.join("datasets.json");
        let mut entries: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&manifest).unwrap()).unwrap();
        entries[project_id] = serde_json::json!({"path": "../../../etc"});
        fs::write(&manifest, serde_json::to_string_pretty(&entries).unwrap()).unwrap();
    }

    /// Pipeline config wired to this dataset and a fake agent script.
    pub fn config(&self, agent_script: &Path) -> AuditConfig {
        let mut config = AuditConfig::default();
        config.dataset_base = self.dataset_base.clone();
        config.database_path = Some(self.dir.path().join("audit.db"));
        config.logs_dir = Some(self.logs_dir.clone());
        config.agent.binary = agent_script.display().to_string();
        config.agent.timeout_sec = 30;
        config
    }
}

/// Write an executable shell script acting as the agent binary. The script
/// receives the prompt on stdin and answers by matching prompt markers.
#[cfg(unix)]
pub fn write_fake_agent(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    let script = format!("#!/bin/sh\nprompt=$(cat)\n{body}\n");
    fs::write(&path, script).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

/// Fake agent covering the whole pipeline for the three-function catalog:
/// planning converges to flow F1 (A.f, A.g), repair adds F2 (B.h),
/// reasoning reports two findings, validation confirms one as a
/// vulnerability.
pub const FULL_PIPELINE_AGENT: &str = r#"
case "$prompt" in
  *"business-flow extraction assistant"*)
    echo "G1 settlement: A.f, A.g"
    echo "F1 trade (groups: G1): A.f, A.g"
    ;;
  *"Output only added or corrected lines"*)
    echo "(no additions)"
    ;;
  *"business_flow_planning_v1"*)
    cat <<'EOF'
{
  "schema_version": "business_flow_planning_v1",
  "groups": [{"group_id": "G1", "group_name": "settlement", "functions": ["A.f", "A.g"]}],
  "flows": [{"flow_id": "F1", "flow_name": "trade", "group_ids": ["G1"], "function_refs": ["A.f", "A.g"]}]
}
EOF
    ;;
  *"business-flow completion assistant"*|*"Converge this repair round"*)
    cat <<'EOF'
{
  "schema_version": "business_flow_coverage_repair_v1",
  "new_groups": [{"group_id": "G2", "group_name": "claims", "functions": ["B.h"]}],
  "new_flows": [{"flow_id": "F2", "flow_name": "claim", "group_ids": ["G2"], "function_refs": ["B.h"]}]
}
EOF
    ;;
  *"re-confirm one candidate"*)
    cat <<'EOF'
{"schema_version": "validation_codex_v1", "status": "vulnerability", "confidence": "high", "exists": true, "classification": "vulnerability", "impact": "high", "exploit_difficulty": "easy", "reason": "reachable without auth", "evidence": [], "doc_references": [], "attack_preconditions": [], "attack_path": "call f", "mitigation": "add check", "unknowns": []}
EOF
    ;;
  *"senior smart contract"*)
    cat <<'EOF'
{"schema_version": "1.0", "vulnerabilities": [{"description": "D1"}, {"description": "D2"}]}
EOF
    ;;
  *)
    echo "unmatched prompt" >&2
    exit 1
    ;;
esac
"#;
