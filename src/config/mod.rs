//! Configuration loading and management.
//!
//! One explicit [`AuditConfig`] record is built at startup from three layers
//! (defaults, optional `.flowaudit/config.toml`, environment snapshot) and
//! threaded through the driver into each component. No component reads the
//! environment after startup.

mod checklists;

pub use checklists::builtin_checklists;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Sandbox mode passed to the agent CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxMode {
    #[default]
    ReadOnly,
    WorkspaceWrite,
}

impl SandboxMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxMode::ReadOnly => "read-only",
            SandboxMode::WorkspaceWrite => "workspace-write",
        }
    }
}

/// Agent CLI settings shared by planning, reasoning, and validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Agent binary (a `codex exec`-compatible CLI).
    #[serde(default = "default_agent_binary")]
    pub binary: String,

    /// Model identifier forwarded with `-m`.
    #[serde(default)]
    pub model: Option<String>,

    /// Per-call deadline in seconds.
    #[serde(default = "default_agent_timeout")]
    pub timeout_sec: u64,

    /// Allow the Reasoner to execute proof-of-concept tests. When set the
    /// Reasoner runs with a workspace-write sandbox; everything else stays
    /// read-only.
    #[serde(default)]
    pub poc_execution: bool,

    /// Extra environment variables for the subprocess.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            binary: default_agent_binary(),
            model: None,
            timeout_sec: default_agent_timeout(),
            poc_execution: false,
            env: HashMap::new(),
        }
    }
}

fn default_agent_binary() -> String {
    "codex".to_string()
}

fn default_agent_timeout() -> u64 {
    1800
}

/// Planning-stage knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanningSettings {
    /// Coverage acceptance target; repair rounds run while below it.
    #[serde(default = "default_coverage_target")]
    pub coverage_target: f64,

    /// Cap on coverage-repair rounds.
    #[serde(default = "default_max_repair_rounds")]
    pub max_repair_rounds: u32,

    /// Allow repair rounds to emit `~` modifications to existing flows.
    #[serde(default)]
    pub allow_flow_modification: bool,
}

impl Default for PlanningSettings {
    fn default() -> Self {
        Self {
            coverage_target: default_coverage_target(),
            max_repair_rounds: default_max_repair_rounds(),
            allow_flow_modification: false,
        }
    }
}

fn default_coverage_target() -> f64 {
    0.90
}

fn default_max_repair_rounds() -> u32 {
    3
}

/// Reasoning-stage knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningSettings {
    /// Round budget the Watcher starts from.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,

    /// Parallel task groups.
    #[serde(default = "default_reasoning_parallel")]
    pub max_parallel: usize,
}

impl Default for ReasoningSettings {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            max_parallel: default_reasoning_parallel(),
        }
    }
}

fn default_max_rounds() -> u32 {
    4
}

fn default_reasoning_parallel() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Validation-stage knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSettings {
    /// Parallel finding checks.
    #[serde(default = "default_validation_parallel")]
    pub max_parallel: usize,

    /// Canary cap: at most this many findings per run (0 = unlimited).
    #[serde(default)]
    pub max_findings: usize,

    /// Per-finding deadline; falls back to the agent timeout when unset.
    #[serde(default)]
    pub timeout_sec: Option<u64>,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            max_parallel: default_validation_parallel(),
            max_findings: 0,
            timeout_sec: None,
        }
    }
}

fn default_validation_parallel() -> usize {
    3
}

/// Top-level configuration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Absolute base directory of the dataset; every workspace must resolve
    /// under it.
    #[serde(default)]
    pub dataset_base: PathBuf,

    /// SQLite database path. Defaults to `<dataset_base>/flowaudit.db`.
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Root for agent invocation artifacts. Defaults to `./logs`.
    #[serde(default)]
    pub logs_dir: Option<PathBuf>,

    /// Override for the tree-sitter export location, relative to each
    /// workspace root or absolute.
    #[serde(default)]
    pub functions_json: Option<PathBuf>,

    /// Checklist categories each flow is scanned under.
    #[serde(default = "default_rule_keys")]
    pub rule_keys: Vec<String>,

    /// Extra or overriding checklist items per rule key.
    #[serde(default)]
    pub checklists: HashMap<String, Vec<String>>,

    /// Parallel projects.
    #[serde(default = "default_project_parallel")]
    pub max_project_parallel: usize,

    #[serde(default)]
    pub agent: AgentSettings,

    #[serde(default)]
    pub planning: PlanningSettings,

    #[serde(default)]
    pub reasoning: ReasoningSettings,

    #[serde(default)]
    pub validation: ValidationSettings,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            dataset_base: PathBuf::new(),
            database_path: None,
            logs_dir: None,
            functions_json: None,
            rule_keys: default_rule_keys(),
            checklists: HashMap::new(),
            max_project_parallel: default_project_parallel(),
            agent: AgentSettings::default(),
            planning: PlanningSettings::default(),
            reasoning: ReasoningSettings::default(),
            validation: ValidationSettings::default(),
        }
    }
}

fn default_rule_keys() -> Vec<String> {
    vec![
        "access_control".to_string(),
        "asset_flow".to_string(),
        "state_consistency".to_string(),
    ]
}

fn default_project_parallel() -> usize {
    4
}

impl AuditConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: AuditConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from a directory, looking for
    /// `.flowaudit/config.toml`. Falls back to defaults.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join(".flowaudit/config.toml");
        if path.exists() {
            return Self::from_file(&path);
        }
        Ok(Self::default())
    }

    /// Overlay the environment snapshot. Later layers win, so call this
    /// after [`AuditConfig::from_dir`] and before CLI overrides.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_var("DATASET_BASE") {
            self.dataset_base = PathBuf::from(v);
        }
        if let Some(v) = env_var("DATABASE_PATH") {
            self.database_path = Some(PathBuf::from(v));
        }
        if let Some(v) = env_var("FUNCTIONS_JSON") {
            self.functions_json = Some(PathBuf::from(v));
        }
        if let Some(v) = env_var("BUSINESS_FLOW_RULE_KEYS") {
            let keys: Vec<String> = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !keys.is_empty() {
                self.rule_keys = keys;
            }
        }
        if let Some(v) = env_parse::<usize>("MAX_REASONING_PARALLEL") {
            self.reasoning.max_parallel = v.max(1);
        }
        if let Some(v) = env_parse::<usize>("MAX_VALIDATION_PARALLEL") {
            self.validation.max_parallel = v.max(1);
        }
        if let Some(v) = env_parse::<u32>("REASONING_MAX_ROUNDS") {
            self.reasoning.max_rounds = v.max(1);
        }
        if let Some(v) = env_parse::<u64>("AGENT_TIMEOUT_SEC") {
            self.agent.timeout_sec = v.max(1);
        }
        if let Some(v) = env_parse::<f64>("COVERAGE_TARGET") {
            if (0.0..=1.0).contains(&v) {
                self.planning.coverage_target = v;
            }
        }
        if let Some(v) = env_var("AGENT_BINARY") {
            self.agent.binary = v;
        }
        if let Some(v) = env_var("AGENT_MODEL") {
            self.agent.model = Some(v);
        }
    }

    /// Effective database path.
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.dataset_base.join("flowaudit.db"))
    }

    /// Effective artifact root.
    pub fn logs_dir(&self) -> PathBuf {
        self.logs_dir.clone().unwrap_or_else(|| PathBuf::from("logs"))
    }

    /// Resolve the tree-sitter export path for a workspace.
    pub fn functions_json_for(&self, workspace_root: &Path) -> PathBuf {
        match &self.functions_json {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => workspace_root.join(p),
            None => workspace_root.join(".flowaudit/functions.json"),
        }
    }

    /// Checklist items for a rule key: config entries win over the built-in
    /// table; unknown keys get an empty list (the flow is still scanned).
    pub fn checklist_for(&self, rule_key: &str) -> Vec<String> {
        if let Some(items) = self.checklists.get(rule_key) {
            return items.clone();
        }
        builtin_checklists()
            .get(rule_key)
            .cloned()
            .unwrap_or_default()
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_var(key).and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AuditConfig::default();
        assert_eq!(config.planning.coverage_target, 0.90);
        assert_eq!(config.agent.binary, "codex");
        assert_eq!(config.agent.timeout_sec, 1800);
        assert!(!config.agent.poc_execution);
        assert_eq!(config.rule_keys.len(), 3);
    }

    #[test]
    fn checklist_lookup_prefers_config_entries() {
        let mut config = AuditConfig::default();
        config
            .checklists
            .insert("access_control".to_string(), vec!["custom item".to_string()]);
        assert_eq!(config.checklist_for("access_control"), vec!["custom item"]);
        assert!(!config.checklist_for("asset_flow").is_empty());
        assert!(config.checklist_for("no_such_key").is_empty());
    }

    #[test]
    fn from_toml() {
        let toml_src = r#"
            dataset_base = "/data/audit"
            rule_keys = ["access_control"]

            [agent]
            binary = "codex-dev"
            timeout_sec = 60

            [planning]
            coverage_target = 0.8
        "#;
        let config: AuditConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(config.dataset_base, PathBuf::from("/data/audit"));
        assert_eq!(config.agent.binary, "codex-dev");
        assert_eq!(config.agent.timeout_sec, 60);
        assert_eq!(config.planning.coverage_target, 0.8);
        assert_eq!(config.rule_keys, vec!["access_control"]);
    }
}
