//! Agent State Artifacts
//!
//! Schema checks for the per-agent files maintained by agent implementations:
//! `<agent_state_dir>/<agent_id>/mailbox.json` and `tasks.json`. The bus only reads them.

use serde_json::Value;
use std::io::ErrorKind;
use std::path::Path;
use tracing::debug;

pub const MAILBOX_FILE: &str = "mailbox.json";
pub const TASKS_FILE: &str = "tasks.json";

const MAILBOX_FIELDS: [&str; 3] = ["agent_id", "status", "pending_operations"];
const TASK_FIELDS: [&str; 3] = ["task_id", "status", "priority"];

/// Errors in a mailbox document, empty when valid
pub fn validate_mailbox(value: &Value) -> Vec<String> {
    let Some(object) = value.as_object() else {
        return vec!["mailbox is not a JSON object".to_string()];
    };

    let mut errors: Vec<String> = MAILBOX_FIELDS
        .iter()
        .filter(|field| !object.contains_key(**field))
        .map(|field| format!("mailbox missing required field '{}'", field))
        .collect();

    if let Some(pending) = object.get("pending_operations") {
        if !pending.is_array() {
            errors.push("mailbox field 'pending_operations' is not a list".to_string());
        }
    }
    errors
}

/// Errors in a task-list document, empty when valid
pub fn validate_task_list(value: &Value) -> Vec<String> {
    let Some(tasks) = value.as_array() else {
        return vec!["task list is not a JSON array".to_string()];
    };

    let mut errors = Vec::new();
    for (index, task) in tasks.iter().enumerate() {
        let Some(object) = task.as_object() else {
            errors.push(format!("task #{} is not a JSON object", index));
            continue;
        };
        for field in TASK_FIELDS {
            if !object.contains_key(field) {
                errors.push(format!("task #{} missing required field '{}'", index, field));
            }
        }
    }
    errors
}

/// Read and validate both artifacts for one agent; missing files are skipped
pub async fn inspect_agent_artifacts(agent_dir: &Path, agent_id: &str) -> Vec<String> {
    let mut errors = Vec::new();

    for (file, validate) in [
        (MAILBOX_FILE, validate_mailbox as fn(&Value) -> Vec<String>),
        (TASKS_FILE, validate_task_list),
    ] {
        let path = agent_dir.join(file);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(agent_id = %agent_id, file, "Agent artifact not present, skipping");
                continue;
            }
            Err(e) => {
                errors.push(format!("agent {}: cannot read {}: {}", agent_id, file, e));
                continue;
            }
        };

        match serde_json::from_str::<Value>(&content) {
            Ok(value) => errors.extend(
                validate(&value)
                    .into_iter()
                    .map(|problem| format!("agent {}: {}: {}", agent_id, file, problem)),
            ),
            Err(e) => errors.push(format!("agent {}: {} is not valid JSON: {}", agent_id, file, e)),
        }
    }

    errors
}
