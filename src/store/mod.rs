//! SQLite persistence for tasks and findings.
//!
//! The database is the single source of truth between stages: planning
//! writes `project_task` rows exactly once per project, reasoning owns a
//! task's mutable columns, validation owns a finding's validation columns.

mod models;
mod repository;

pub use models::{DedupStatus, Finding, ShortResult, Task, ValidationStatus};
pub use repository::{FindingRepository, TaskRepository};

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rusqlite::Connection;

/// Database handle shared by the repositories.
#[derive(Clone)]
pub struct AuditDb {
    conn: Arc<Mutex<Connection>>,
}

impl AuditDb {
    /// Open or create the database at a specific path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create db dir: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open db: {}", path.display()))?;

        // WAL for concurrent stage workers.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    pub(crate) fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("audit db lock poisoned")
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }
}

/// Run a store operation, retrying once with a short backoff.
///
/// The second failure bubbles up and stops the driver.
pub fn with_retry<T>(op: impl Fn() -> Result<T>) -> Result<T> {
    match op() {
        Ok(value) => Ok(value),
        Err(first) => {
            tracing::warn!(error = %first, "store operation failed, retrying once");
            std::thread::sleep(std::time::Duration::from_millis(250));
            op()
        }
    }
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS fa_schema_version (version INTEGER PRIMARY KEY);
INSERT OR IGNORE INTO fa_schema_version VALUES (1);

-- One row per (business flow x rule key).
CREATE TABLE IF NOT EXISTS project_task (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    uuid TEXT UNIQUE NOT NULL,
    project_id TEXT NOT NULL,
    name TEXT NOT NULL,
    content TEXT NOT NULL DEFAULT '',
    rule TEXT NOT NULL DEFAULT '',
    rule_key TEXT NOT NULL DEFAULT '',
    result TEXT NOT NULL DEFAULT '',
    contract_code TEXT NOT NULL DEFAULT '',
    start_line TEXT NOT NULL DEFAULT '',
    end_line TEXT NOT NULL DEFAULT '',
    relative_file_path TEXT NOT NULL DEFAULT '',
    absolute_file_path TEXT NOT NULL DEFAULT '',
    recommendation TEXT NOT NULL DEFAULT '',
    business_flow_code TEXT NOT NULL DEFAULT '',
    scan_record TEXT NOT NULL DEFAULT '',
    short_result TEXT NOT NULL DEFAULT '',
    "group" TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_task_project ON project_task(project_id);
CREATE INDEX IF NOT EXISTS idx_task_group ON project_task("group");

-- One row per single-vulnerability finding split out of a task result.
-- Task context is denormalized so a finding is self-contained for
-- validation and export.
CREATE TABLE IF NOT EXISTS project_finding (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    uuid TEXT UNIQUE NOT NULL,
    project_id TEXT NOT NULL,
    task_id INTEGER NOT NULL,
    task_uuid TEXT NOT NULL,
    rule_key TEXT NOT NULL DEFAULT '',
    finding_json TEXT NOT NULL,
    task_name TEXT NOT NULL DEFAULT '',
    task_content TEXT NOT NULL DEFAULT '',
    task_business_flow_code TEXT NOT NULL DEFAULT '',
    task_contract_code TEXT NOT NULL DEFAULT '',
    task_start_line TEXT NOT NULL DEFAULT '',
    task_end_line TEXT NOT NULL DEFAULT '',
    task_relative_file_path TEXT NOT NULL DEFAULT '',
    task_absolute_file_path TEXT NOT NULL DEFAULT '',
    task_rule TEXT NOT NULL DEFAULT '',
    task_group TEXT NOT NULL DEFAULT '',
    dedup_status TEXT NOT NULL DEFAULT 'kept',
    validation_status TEXT NOT NULL DEFAULT 'pending',
    validation_record TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_finding_project ON project_finding(project_id);
CREATE INDEX IF NOT EXISTS idx_finding_task ON project_finding(task_id);
CREATE INDEX IF NOT EXISTS idx_finding_validation ON project_finding(validation_status);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_and_init() {
        let dir = tempdir().unwrap();
        let db = AuditDb::open(&dir.path().join("audit.db")).unwrap();

        let conn = db.conn();
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap();
        let tables: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        assert!(tables.contains(&"project_task".to_string()));
        assert!(tables.contains(&"project_finding".to_string()));
    }
}
