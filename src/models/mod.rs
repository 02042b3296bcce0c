// Task descriptors supplied by the upstream backlog

use crate::error::{ParallelError, Result};
use crate::utils::{sanitize_branch_component, sanitize_path_component};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// One unit of work as described by the backlog. Consumed read-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskDescriptor {
    pub id: String,
    pub label: String,
    /// Paths (relative to the repository root) the task expects to touch
    #[serde(default, alias = "file_impact_hints")]
    pub file_impact_hints: Vec<String>,
    #[serde(default, alias = "backlog_item_id", skip_serializing_if = "Option::is_none")]
    pub backlog_item_id: Option<String>,
}

impl TaskDescriptor {
    pub fn new(id: impl Into<String>, label: impl Into<String>, hints: &[&str]) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            file_impact_hints: hints.iter().map(|h| h.to_string()).collect(),
            backlog_item_id: None,
        }
    }
}

/// Load a task list from a YAML or JSON file, chosen by extension
pub fn load_tasks(path: &Path) -> Result<Vec<TaskDescriptor>> {
    let content = std::fs::read_to_string(path)?;

    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let tasks: Vec<TaskDescriptor> = if is_json {
        serde_json::from_str(&content).map_err(|e| {
            ParallelError::SeparationAnalysis(format!(
                "Failed to parse task file '{}': {}",
                path.display(),
                e
            ))
        })?
    } else {
        serde_yaml::from_str(&content).map_err(|e| {
            ParallelError::SeparationAnalysis(format!(
                "Failed to parse task file '{}': {}",
                path.display(),
                e
            ))
        })?
    };

    check_task_ids(&tasks)?;

    log::debug!("[Tasks] Loaded {} task(s) from {}", tasks.len(), path.display());
    Ok(tasks)
}

/// Reject empty ids and ids that would share a branch or workspace directory
pub fn check_task_ids(tasks: &[TaskDescriptor]) -> Result<()> {
    let mut branches: HashMap<String, &str> = HashMap::new();
    let mut paths: HashMap<String, &str> = HashMap::new();

    for task in tasks {
        if task.id.trim().is_empty() {
            return Err(ParallelError::SeparationAnalysis(
                "task id must not be empty".to_string(),
            ));
        }

        let earlier = branches
            .insert(sanitize_branch_component(&task.id), &task.id)
            .or_else(|| paths.insert(sanitize_path_component(&task.id), &task.id));
        if let Some(other) = earlier {
            return Err(ParallelError::SeparationAnalysis(if other == task.id {
                format!("duplicate task id '{}'", task.id)
            } else {
                format!(
                    "task ids '{}' and '{}' map to the same branch or workspace",
                    other, task.id
                )
            }));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_yaml_tasks() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tasks.yaml");
        std::fs::write(
            &path,
            r#"
- id: T-1
  label: Add login form
  fileImpactHints: [src/login.rs]
  backlogItemId: US-1
- id: T-2
  label: Add logout
  file_impact_hints: [src/logout.rs]
"#,
        )
        .unwrap();

        let tasks = load_tasks(&path).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].backlog_item_id.as_deref(), Some("US-1"));
        assert_eq!(tasks[1].file_impact_hints, vec!["src/logout.rs".to_string()]);
    }

    #[test]
    fn test_load_json_tasks() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tasks.json");
        std::fs::write(
            &path,
            r#"[{"id":"T-1","label":"One","fileImpactHints":["a.rs"]}]"#,
        )
        .unwrap();

        let tasks = load_tasks(&path).unwrap();
        assert_eq!(tasks, vec![TaskDescriptor::new("T-1", "One", &["a.rs"])]);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tasks.json");
        std::fs::write(
            &path,
            r#"[{"id":"T-1","label":"One"},{"id":"T-1","label":"Again"}]"#,
        )
        .unwrap();

        assert!(matches!(
            load_tasks(&path),
            Err(ParallelError::SeparationAnalysis(_))
        ));
    }

    #[test]
    fn test_ids_with_same_branch_or_directory_rejected() {
        let same_branch = [
            TaskDescriptor::new("a b", "One", &[]),
            TaskDescriptor::new("a-b", "Two", &[]),
        ];
        match check_task_ids(&same_branch) {
            Err(ParallelError::SeparationAnalysis(msg)) => {
                assert!(msg.contains("'a b' and 'a-b'"), "{}", msg)
            }
            other => panic!("expected SeparationAnalysis, got {:?}", other),
        }

        let same_directory = [
            TaskDescriptor::new("US-1.1", "One", &[]),
            TaskDescriptor::new("US-1_1", "Two", &[]),
        ];
        assert!(matches!(
            check_task_ids(&same_directory),
            Err(ParallelError::SeparationAnalysis(_))
        ));

        let distinct = [
            TaskDescriptor::new("US-1.1", "One", &[]),
            TaskDescriptor::new("US-1.2", "Two", &[]),
        ];
        assert!(check_task_ids(&distinct).is_ok());
    }
}
