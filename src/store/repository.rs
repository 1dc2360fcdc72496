//! Repository implementations for task and finding access.

use anyhow::{Context, Result};
use rusqlite::{params, Row};

use super::models::{DedupStatus, Finding, ShortResult, Task, ValidationStatus};
use super::AuditDb;

const TASK_COLUMNS: &str = "id, uuid, project_id, name, content, rule, rule_key, result, \
     contract_code, start_line, end_line, relative_file_path, absolute_file_path, \
     recommendation, business_flow_code, scan_record, short_result, \"group\"";

const FINDING_COLUMNS: &str = "id, uuid, project_id, task_id, task_uuid, rule_key, finding_json, \
     task_name, task_content, task_business_flow_code, task_contract_code, \
     task_start_line, task_end_line, task_relative_file_path, task_absolute_file_path, \
     task_rule, task_group, dedup_status, validation_status, validation_record";

/// Repository for `project_task`.
#[derive(Clone)]
pub struct TaskRepository {
    db: AuditDb,
}

impl TaskRepository {
    pub fn new(db: AuditDb) -> Self {
        Self { db }
    }

    /// Insert one task, returning its row id.
    pub fn insert_task(&self, task: &Task) -> Result<i64> {
        let conn = self.db.conn();
        conn.execute(
            r#"
            INSERT INTO project_task (
                uuid, project_id, name, content, rule, rule_key, result,
                contract_code, start_line, end_line, relative_file_path,
                absolute_file_path, recommendation, business_flow_code,
                scan_record, short_result, "group"
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            "#,
            params![
                task.uuid,
                task.project_id,
                task.name,
                task.content,
                task.rule,
                task.rule_key,
                task.result,
                task.contract_code,
                task.start_line,
                task.end_line,
                task.relative_file_path,
                task.absolute_file_path,
                task.recommendation,
                task.business_flow_code,
                task.scan_record,
                task.short_result.as_str(),
                task.group,
            ],
        )
        .context("Failed to insert task")?;
        Ok(conn.last_insert_rowid())
    }

    /// Insert many tasks in one transaction.
    pub fn bulk_insert_tasks(&self, tasks: &[Task]) -> Result<usize> {
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO project_task (
                    uuid, project_id, name, content, rule, rule_key, result,
                    contract_code, start_line, end_line, relative_file_path,
                    absolute_file_path, recommendation, business_flow_code,
                    scan_record, short_result, "group"
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
                "#,
            )?;
            for task in tasks {
                stmt.execute(params![
                    task.uuid,
                    task.project_id,
                    task.name,
                    task.content,
                    task.rule,
                    task.rule_key,
                    task.result,
                    task.contract_code,
                    task.start_line,
                    task.end_line,
                    task.relative_file_path,
                    task.absolute_file_path,
                    task.recommendation,
                    task.business_flow_code,
                    task.scan_record,
                    task.short_result.as_str(),
                    task.group,
                ])?;
            }
        }
        tx.commit().context("Failed to commit task batch")?;
        Ok(tasks.len())
    }

    pub fn get(&self, task_id: i64) -> Result<Option<Task>> {
        let conn = self.db.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {TASK_COLUMNS} FROM project_task WHERE id = ?1"))?;
        let result = stmt.query_row(params![task_id], |row| Ok(row_to_task(row)));
        match result {
            Ok(task) => Ok(Some(task)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// All tasks of a project in insertion order.
    pub fn tasks_by_project(&self, project_id: &str) -> Result<Vec<Task>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM project_task WHERE project_id = ?1 ORDER BY id"
        ))?;
        let tasks = stmt
            .query_map(params![project_id], |row| Ok(row_to_task(row)))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(tasks)
    }

    pub fn count_tasks(&self, project_id: &str) -> Result<usize> {
        let conn = self.db.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM project_task WHERE project_id = ?1",
            params![project_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn update_task_result(&self, task_id: i64, result_json: &str) -> Result<()> {
        let conn = self.db.conn();
        conn.execute(
            "UPDATE project_task SET result = ?2 WHERE id = ?1",
            params![task_id, result_json],
        )
        .context("Failed to update task result")?;
        Ok(())
    }

    pub fn set_task_short_result(&self, task_id: i64, value: ShortResult) -> Result<()> {
        let conn = self.db.conn();
        conn.execute(
            "UPDATE project_task SET short_result = ?2 WHERE id = ?1",
            params![task_id, value.as_str()],
        )
        .context("Failed to update task short_result")?;
        Ok(())
    }

    pub fn update_task_scan_record(&self, task_id: i64, scan_record: &str) -> Result<()> {
        let conn = self.db.conn();
        conn.execute(
            "UPDATE project_task SET scan_record = ?2 WHERE id = ?1",
            params![task_id, scan_record],
        )
        .context("Failed to update task scan_record")?;
        Ok(())
    }
}

/// Repository for `project_finding`.
#[derive(Clone)]
pub struct FindingRepository {
    db: AuditDb,
}

impl FindingRepository {
    pub fn new(db: AuditDb) -> Self {
        Self { db }
    }

    /// Atomically delete a task's findings and insert the replacement set.
    ///
    /// The single transaction keeps the split idempotent: a crash leaves
    /// either the old set or the new set, never a mix.
    pub fn replace_task_findings(&self, task_id: i64, findings: &[Finding]) -> Result<usize> {
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM project_finding WHERE task_id = ?1",
            params![task_id],
        )?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO project_finding (
                    uuid, project_id, task_id, task_uuid, rule_key, finding_json,
                    task_name, task_content, task_business_flow_code, task_contract_code,
                    task_start_line, task_end_line, task_relative_file_path,
                    task_absolute_file_path, task_rule, task_group,
                    dedup_status, validation_status, validation_record
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
                "#,
            )?;
            for finding in findings {
                stmt.execute(params![
                    finding.uuid,
                    finding.project_id,
                    finding.task_id,
                    finding.task_uuid,
                    finding.rule_key,
                    finding.finding_json,
                    finding.task_name,
                    finding.task_content,
                    finding.task_business_flow_code,
                    finding.task_contract_code,
                    finding.task_start_line,
                    finding.task_end_line,
                    finding.task_relative_file_path,
                    finding.task_absolute_file_path,
                    finding.task_rule,
                    finding.task_group,
                    finding.dedup_status.as_str(),
                    finding
                        .validation_status
                        .map(|s| s.as_str())
                        .unwrap_or(""),
                    finding.validation_record,
                ])?;
            }
        }
        tx.commit().context("Failed to commit finding replacement")?;
        Ok(findings.len())
    }

    pub fn list_findings_by_task(&self, task_id: i64) -> Result<Vec<Finding>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {FINDING_COLUMNS} FROM project_finding WHERE task_id = ?1 ORDER BY id"
        ))?;
        let findings = stmt
            .query_map(params![task_id], |row| Ok(row_to_finding(row)))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(findings)
    }

    /// Findings awaiting validation: not dedup-deleted, status empty or
    /// pending.
    pub fn list_findings_for_validation(&self, project_id: &str) -> Result<Vec<Finding>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {FINDING_COLUMNS} FROM project_finding
            WHERE project_id = ?1
              AND dedup_status != 'delete'
              AND validation_status IN ('', 'pending')
            ORDER BY id
            "#
        ))?;
        let findings = stmt
            .query_map(params![project_id], |row| Ok(row_to_finding(row)))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(findings)
    }

    /// Export set: confirmed vulnerabilities only.
    pub fn list_findings_for_export(&self, project_id: &str) -> Result<Vec<Finding>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {FINDING_COLUMNS} FROM project_finding
            WHERE project_id = ?1
              AND dedup_status != 'delete'
              AND validation_status = 'vulnerability'
            ORDER BY id
            "#
        ))?;
        let findings = stmt
            .query_map(params![project_id], |row| Ok(row_to_finding(row)))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(findings)
    }

    /// All findings not dedup-deleted (report dump, dedup input).
    pub fn list_kept_findings(&self, project_id: &str) -> Result<Vec<Finding>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {FINDING_COLUMNS} FROM project_finding
            WHERE project_id = ?1 AND dedup_status != 'delete'
            ORDER BY id
            "#
        ))?;
        let findings = stmt
            .query_map(params![project_id], |row| Ok(row_to_finding(row)))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(findings)
    }

    pub fn update_finding_validation(
        &self,
        finding_id: i64,
        status: ValidationStatus,
        record: &str,
    ) -> Result<()> {
        let conn = self.db.conn();
        conn.execute(
            "UPDATE project_finding SET validation_status = ?2, validation_record = ?3 WHERE id = ?1",
            params![finding_id, status.as_str(), record],
        )
        .context("Failed to update finding validation")?;
        Ok(())
    }

    pub fn update_dedup_status(&self, finding_id: i64, status: DedupStatus) -> Result<()> {
        let conn = self.db.conn();
        conn.execute(
            "UPDATE project_finding SET dedup_status = ?2 WHERE id = ?1",
            params![finding_id, status.as_str()],
        )
        .context("Failed to update finding dedup status")?;
        Ok(())
    }
}

fn row_to_task(row: &Row) -> Task {
    Task {
        id: row.get(0).unwrap_or_default(),
        uuid: row.get(1).unwrap_or_default(),
        project_id: row.get(2).unwrap_or_default(),
        name: row.get(3).unwrap_or_default(),
        content: row.get(4).unwrap_or_default(),
        rule: row.get(5).unwrap_or_default(),
        rule_key: row.get(6).unwrap_or_default(),
        result: row.get(7).unwrap_or_default(),
        contract_code: row.get(8).unwrap_or_default(),
        start_line: row.get(9).unwrap_or_default(),
        end_line: row.get(10).unwrap_or_default(),
        relative_file_path: row.get(11).unwrap_or_default(),
        absolute_file_path: row.get(12).unwrap_or_default(),
        recommendation: row.get(13).unwrap_or_default(),
        business_flow_code: row.get(14).unwrap_or_default(),
        scan_record: row.get(15).unwrap_or_default(),
        short_result: ShortResult::from_str(&row.get::<_, String>(16).unwrap_or_default()),
        group: row.get(17).unwrap_or_default(),
    }
}

fn row_to_finding(row: &Row) -> Finding {
    Finding {
        id: row.get(0).unwrap_or_default(),
        uuid: row.get(1).unwrap_or_default(),
        project_id: row.get(2).unwrap_or_default(),
        task_id: row.get(3).unwrap_or_default(),
        task_uuid: row.get(4).unwrap_or_default(),
        rule_key: row.get(5).unwrap_or_default(),
        finding_json: row.get(6).unwrap_or_default(),
        task_name: row.get(7).unwrap_or_default(),
        task_content: row.get(8).unwrap_or_default(),
        task_business_flow_code: row.get(9).unwrap_or_default(),
        task_contract_code: row.get(10).unwrap_or_default(),
        task_start_line: row.get(11).unwrap_or_default(),
        task_end_line: row.get(12).unwrap_or_default(),
        task_relative_file_path: row.get(13).unwrap_or_default(),
        task_absolute_file_path: row.get(14).unwrap_or_default(),
        task_rule: row.get(15).unwrap_or_default(),
        task_group: row.get(16).unwrap_or_default(),
        dedup_status: DedupStatus::from_str(&row.get::<_, String>(17).unwrap_or_default()),
        validation_status: row
            .get::<_, String>(18)
            .ok()
            .as_deref()
            .and_then(ValidationStatus::from_str),
        validation_record: row.get(19).unwrap_or_default(),
    }
}
