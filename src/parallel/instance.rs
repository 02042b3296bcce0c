// Task instance records and their lifecycle state machine

use crate::error::{ParallelError, Result};
use crate::models::TaskDescriptor;
use crate::parallel::workspaces::Workspace;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of one task instance
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Spawning,
    Running,
    Completed,
    Failed,
    Merging,
    Merged,
    Conflicted,
    CleanedUp,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceState::Pending => "pending",
            InstanceState::Spawning => "spawning",
            InstanceState::Running => "running",
            InstanceState::Completed => "completed",
            InstanceState::Failed => "failed",
            InstanceState::Merging => "merging",
            InstanceState::Merged => "merged",
            InstanceState::Conflicted => "conflicted",
            InstanceState::CleanedUp => "cleaned_up",
        };
        write!(f, "{}", s)
    }
}

/// Validates if an instance can move from one state to another
pub fn can_transition(from: InstanceState, to: InstanceState) -> bool {
    use InstanceState::*;
    match (from, to) {
        (Pending, Spawning) => true,
        (Pending, Failed) => true,

        (Spawning, Running) => true,
        (Spawning, Failed) => true,

        (Running, Completed) => true,
        (Running, Failed) => true,

        // Only completed work is ever integrated
        (Completed, Merging) => true,

        (Merging, Merged) => true,
        (Merging, Conflicted) => true,
        // Merge errored without conflicts; eligible for retry
        (Merging, Completed) => true,

        (Merged, CleanedUp) => true,
        (Failed, CleanedUp) => true,
        (Conflicted, CleanedUp) => true,

        // Cancellation from any live state
        (Pending | Spawning | Running | Completed, CleanedUp) => true,

        _ => false,
    }
}

/// Validates and performs a state transition
pub fn transition_state(
    task_id: &str,
    current: InstanceState,
    target: InstanceState,
) -> Result<InstanceState> {
    if !can_transition(current, target) {
        return Err(ParallelError::InvalidTransition {
            task_id: task_id.to_string(),
            from: current,
            to: target,
        });
    }
    Ok(target)
}

/// States that count as in flight: they may still produce work to merge
pub fn is_in_flight(state: InstanceState) -> bool {
    matches!(
        state,
        InstanceState::Spawning
            | InstanceState::Running
            | InstanceState::Completed
            | InstanceState::Merging
    )
}

/// States that hold a workspace waiting for an operator
pub fn is_preserved(state: InstanceState) -> bool {
    matches!(state, InstanceState::Failed | InstanceState::Conflicted)
}

/// Runtime record of one worker executing one task in one workspace
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskInstance {
    pub task_id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backlog_item_id: Option<String>,
    pub file_impact_hints: Vec<String>,
    pub workspace: Workspace,
    pub branch_name: String,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: InstanceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicting_files: Vec<String>,
    /// Admitted despite a Caution separation report
    #[serde(default)]
    pub flagged: bool,
    #[serde(default)]
    pub stalled: bool,
    /// Operator has seen this Failed/Conflicted instance; cleanup may proceed
    #[serde(default)]
    pub acknowledged: bool,
}

impl TaskInstance {
    pub fn new(task: &TaskDescriptor, workspace: Workspace) -> Self {
        let now = Utc::now();
        Self {
            task_id: task.id.clone(),
            label: task.label.clone(),
            backlog_item_id: task.backlog_item_id.clone(),
            file_impact_hints: task.file_impact_hints.clone(),
            branch_name: workspace.branch_name.clone(),
            workspace,
            pid: None,
            started_at: now,
            updated_at: now,
            state: InstanceState::Pending,
            exit_code: None,
            failure_reason: None,
            conflicting_files: Vec::new(),
            flagged: false,
            stalled: false,
            acknowledged: false,
        }
    }

    /// Descriptor this instance was created from
    pub fn descriptor(&self) -> TaskDescriptor {
        TaskDescriptor {
            id: self.task_id.clone(),
            label: self.label.clone(),
            file_impact_hints: self.file_impact_hints.clone(),
            backlog_item_id: self.backlog_item_id.clone(),
        }
    }

    /// Move to `target`, logging the change
    pub fn transition(&mut self, target: InstanceState) -> Result<()> {
        let from = self.state;
        self.state = transition_state(&self.task_id, from, target)?;
        self.updated_at = Utc::now();
        log::info!(
            "[Coordinator] Task {} ({}) {} -> {}",
            self.task_id,
            self.branch_name,
            from,
            target
        );
        Ok(())
    }

    /// Seconds since the instance was admitted
    pub fn running_secs(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }

    /// Whether cleanup is allowed right now
    pub fn can_clean_up(&self) -> bool {
        match self.state {
            InstanceState::Merged => true,
            InstanceState::Failed | InstanceState::Conflicted => self.acknowledged,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn instance() -> TaskInstance {
        let workspace = Workspace {
            path: PathBuf::from("/repo/.worktrees/T-1"),
            branch_name: "task/T-1".to_string(),
            head_revision: None,
            is_primary: false,
        };
        TaskInstance::new(&TaskDescriptor::new("T-1", "One", &["a.rs"]), workspace)
    }

    #[test]
    fn test_happy_path() {
        let mut inst = instance();
        for state in [
            InstanceState::Spawning,
            InstanceState::Running,
            InstanceState::Completed,
            InstanceState::Merging,
            InstanceState::Merged,
        ] {
            inst.transition(state).unwrap();
        }
        assert!(inst.can_clean_up());
        inst.transition(InstanceState::CleanedUp).unwrap();
    }

    #[test]
    fn test_failed_never_merges() {
        assert!(!can_transition(InstanceState::Failed, InstanceState::Merging));
        assert!(!can_transition(InstanceState::Running, InstanceState::Merging));
        assert!(!can_transition(InstanceState::Conflicted, InstanceState::Merging));
    }

    #[test]
    fn test_invalid_transition_error() {
        let mut inst = instance();
        let err = inst.transition(InstanceState::Merged).unwrap_err();
        assert!(matches!(
            err,
            ParallelError::InvalidTransition {
                from: InstanceState::Pending,
                to: InstanceState::Merged,
                ..
            }
        ));
        assert_eq!(inst.state, InstanceState::Pending);
    }

    #[test]
    fn test_cleanup_requires_acknowledgement_for_failures() {
        let mut inst = instance();
        inst.transition(InstanceState::Spawning).unwrap();
        inst.transition(InstanceState::Running).unwrap();
        inst.transition(InstanceState::Failed).unwrap();
        assert!(!inst.can_clean_up());

        inst.acknowledged = true;
        assert!(inst.can_clean_up());
    }

    #[test]
    fn test_cleaned_up_is_final() {
        for state in [
            InstanceState::Pending,
            InstanceState::Running,
            InstanceState::Merging,
            InstanceState::Failed,
        ] {
            assert!(!can_transition(InstanceState::CleanedUp, state));
        }
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(
            serde_json::to_string(&InstanceState::CleanedUp).unwrap(),
            "\"cleaned_up\""
        );
        let inst = instance();
        let json = serde_json::to_value(&inst).unwrap();
        assert_eq!(json["taskId"], "T-1");
        assert_eq!(json["branchName"], "task/T-1");
        assert_eq!(json["state"], "pending");
    }
}
