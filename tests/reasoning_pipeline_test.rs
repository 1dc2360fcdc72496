//! Reasoning stage end-to-end: resume semantics and idempotent split.

#![cfg(unix)]

mod common;

use std::collections::BTreeSet;

use common::{write_fake_agent, TestDataset, FULL_PIPELINE_AGENT, PROJECT_ID};
use flowaudit::store::{
    FindingRepository, ShortResult, Task, TaskRepository, ValidationStatus,
};
use flowaudit::{PipelineDriver, Stage};

fn seed_task(tasks: &TaskRepository, name: &str, group: &str, rule_key: &str) -> Task {
    let mut task = Task::new(PROJECT_ID, name);
    task.group = group.to_string();
    task.rule_key = rule_key.to_string();
    task.business_flow_code = "function f() { }".to_string();
    task.rule = serde_json::json!({
        "flow_id": group,
        "checklist": ["missing auth on entry points"]
    })
    .to_string();
    task.id = tasks.insert_task(&task).unwrap();
    task
}

#[tokio::test]
async fn two_finding_round_splits_and_marks_done() {
    let dataset = TestDataset::create();
    let agent = write_fake_agent(dataset.dir.path(), "agent.sh", FULL_PIPELINE_AGENT);
    let driver = PipelineDriver::new(dataset.config(&agent)).unwrap();
    let tasks = TaskRepository::new(driver.db().clone());
    let findings = FindingRepository::new(driver.db().clone());

    let task = seed_task(&tasks, "Fi:F1 trade [access_control]", "F1", "access_control");

    let summary = driver
        .run(&[PROJECT_ID.to_string()], Stage::Reason)
        .await
        .unwrap();
    assert_eq!(summary.reasoned(), 1);

    let stored = tasks.get(task.id).unwrap().unwrap();
    assert_eq!(stored.short_result, ShortResult::SplitDone);
    let result: serde_json::Value = serde_json::from_str(&stored.result).unwrap();
    assert_eq!(result["vulnerabilities"].as_array().unwrap().len(), 2);

    // scan_record carries the trace, not the stdout.
    let trace: serde_json::Value = serde_json::from_str(&stored.scan_record).unwrap();
    assert_eq!(trace["schema_version"], "reasoning_trace_v1");
    assert!(!trace["rounds"].as_array().unwrap().is_empty());

    let rows = findings.list_findings_by_task(task.id).unwrap();
    assert_eq!(rows.len(), 2);
    for row in &rows {
        let payload: serde_json::Value = serde_json::from_str(&row.finding_json).unwrap();
        assert_eq!(payload["vulnerabilities"].as_array().unwrap().len(), 1);
        assert_eq!(row.validation_status, Some(ValidationStatus::Pending));
        assert_eq!(row.task_business_flow_code, "function f() { }");
    }
}

#[tokio::test]
async fn interrupted_split_reruns_to_the_same_finding_set() {
    let dataset = TestDataset::create();
    let agent = write_fake_agent(dataset.dir.path(), "agent.sh", FULL_PIPELINE_AGENT);
    let driver = PipelineDriver::new(dataset.config(&agent)).unwrap();
    let tasks = TaskRepository::new(driver.db().clone());
    let findings = FindingRepository::new(driver.db().clone());

    let task = seed_task(&tasks, "Fi:F1 trade [access_control]", "F1", "access_control");
    driver
        .run(&[PROJECT_ID.to_string()], Stage::Reason)
        .await
        .unwrap();

    let before: BTreeSet<String> = findings
        .list_findings_by_task(task.id)
        .unwrap()
        .iter()
        .filter_map(|f| f.description())
        .collect();
    assert_eq!(before.len(), 2);

    // Simulated crash between result write and split completion.
    tasks
        .set_task_short_result(task.id, ShortResult::Empty)
        .unwrap();

    let summary = driver
        .run(&[PROJECT_ID.to_string()], Stage::Reason)
        .await
        .unwrap();
    assert_eq!(summary.reasoned(), 1);

    let stored = tasks.get(task.id).unwrap().unwrap();
    assert_eq!(stored.short_result, ShortResult::SplitDone);

    let after: BTreeSet<String> = findings
        .list_findings_by_task(task.id)
        .unwrap()
        .iter()
        .filter_map(|f| f.description())
        .collect();
    assert_eq!(before, after, "split must be idempotent");
}

#[tokio::test]
async fn completed_task_is_skipped_on_rerun() {
    let dataset = TestDataset::create();
    let agent = write_fake_agent(dataset.dir.path(), "agent.sh", FULL_PIPELINE_AGENT);
    let driver = PipelineDriver::new(dataset.config(&agent)).unwrap();
    let tasks = TaskRepository::new(driver.db().clone());

    seed_task(&tasks, "Fi:F1 trade [access_control]", "F1", "access_control");
    driver
        .run(&[PROJECT_ID.to_string()], Stage::Reason)
        .await
        .unwrap();

    let rerun = driver
        .run(&[PROJECT_ID.to_string()], Stage::Reason)
        .await
        .unwrap();
    assert_eq!(rerun.reasoned(), 0, "split_done tasks are skipped");
    assert_eq!(rerun.errors(), 0);
}

#[tokio::test]
async fn zero_finding_round_still_completes_the_split() {
    let dataset = TestDataset::create();
    let agent = write_fake_agent(
        dataset.dir.path(),
        "agent.sh",
        r#"
case "$prompt" in
  *"senior smart contract"*)
    echo '{"schema_version": "1.0", "vulnerabilities": []}'
    ;;
  *) exit 1 ;;
esac
"#,
    );
    let driver = PipelineDriver::new(dataset.config(&agent)).unwrap();
    let tasks = TaskRepository::new(driver.db().clone());
    let findings = FindingRepository::new(driver.db().clone());

    let task = seed_task(&tasks, "Fi:F1 trade [access_control]", "F1", "access_control");
    driver
        .run(&[PROJECT_ID.to_string()], Stage::Reason)
        .await
        .unwrap();

    let stored = tasks.get(task.id).unwrap().unwrap();
    assert_eq!(stored.short_result, ShortResult::SplitDone);
    let result: serde_json::Value = serde_json::from_str(&stored.result).unwrap();
    assert_eq!(result["vulnerabilities"].as_array().unwrap().len(), 0);
    assert!(findings.list_findings_by_task(task.id).unwrap().is_empty());
}

#[tokio::test]
async fn malformed_output_stores_raw_text_for_reattempt() {
    let dataset = TestDataset::create();
    let agent = write_fake_agent(
        dataset.dir.path(),
        "agent.sh",
        r#"echo "I believe there may be issues but cannot express them as JSON""#,
    );
    let driver = PipelineDriver::new(dataset.config(&agent)).unwrap();
    let tasks = TaskRepository::new(driver.db().clone());
    let findings = FindingRepository::new(driver.db().clone());

    let task = seed_task(&tasks, "Fi:F1 trade [access_control]", "F1", "access_control");
    let summary = driver
        .run(&[PROJECT_ID.to_string()], Stage::Reason)
        .await
        .unwrap();
    assert!(summary.errors() > 0);

    let stored = tasks.get(task.id).unwrap().unwrap();
    assert!(stored.result.contains("cannot express them as JSON"));
    assert_eq!(
        stored.short_result,
        ShortResult::Empty,
        "a malformed round leaves the task eligible for a re-attempt"
    );
    assert!(findings.list_findings_by_task(task.id).unwrap().is_empty());
}

#[tokio::test]
async fn groups_execute_serially_in_insertion_order() {
    let dataset = TestDataset::create();
    // The agent appends each task's checklist marker to a shared log; a
    // serial group must come out in insertion order.
    let log_path = dataset.dir.path().join("calls.log");
    let agent = write_fake_agent(
        dataset.dir.path(),
        "agent.sh",
        &format!(
            r#"
marker=$(printf '%s' "$prompt" | grep -o 'task-order-[a-z0-9]*' | head -n 1)
echo "$marker" >> {}
echo '{{"schema_version": "1.0", "vulnerabilities": []}}'
"#,
            log_path.display()
        ),
    );
    let driver = PipelineDriver::new(dataset.config(&agent)).unwrap();
    let tasks = TaskRepository::new(driver.db().clone());

    for suffix in ["a", "b", "c"] {
        let mut task = Task::new(PROJECT_ID, format!("Fi:F1 x [k-{suffix}]"));
        task.group = "F1".to_string();
        task.rule_key = format!("k-{suffix}");
        task.business_flow_code = "function f() { }".to_string();
        task.rule = serde_json::json!({"checklist": [format!("task-order-{suffix}")]}).to_string();
        task.id = tasks.insert_task(&task).unwrap();
    }

    driver
        .run(&[PROJECT_ID.to_string()], Stage::Reason)
        .await
        .unwrap();

    let log = std::fs::read_to_string(&log_path).unwrap();
    let order: Vec<&str> = log.lines().collect();
    assert_eq!(order, vec!["task-order-a", "task-order-b", "task-order-c"]);
}
