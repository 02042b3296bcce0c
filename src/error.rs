// Error taxonomy for the parallel execution engine

use crate::parallel::instance::InstanceState;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParallelError {
    #[error("Failed to create workspace for task {task_id}: {reason}")]
    WorkspaceCreation { task_id: String, reason: String },

    #[error("Workspace {path:?} has {reason}")]
    WorkspaceNotClean { path: PathBuf, reason: String },

    #[error("Path {path:?} escapes workspace root {root:?}")]
    Security { path: PathBuf, root: PathBuf },

    #[error("Failed to spawn worker for task {task_id}: {reason}")]
    Spawn { task_id: String, reason: String },

    #[error("Admission denied: {0}")]
    ResourceExhausted(String),

    #[error("Invalid task descriptor: {0}")]
    SeparationAnalysis(String),

    #[error("Task {task_id} cannot run alongside {conflicts_with:?} (shared files: {shared_files:?})")]
    ConcurrencyBlocked {
        task_id: String,
        conflicts_with: Vec<String>,
        shared_files: Vec<String>,
    },

    #[error("Merge of {branch} for task {task_id} conflicted in {files:?}")]
    MergeConflict {
        task_id: String,
        branch: String,
        files: Vec<String>,
    },

    #[error("Worker for task {task_id} exited with code {exit_code}")]
    ProcessCrash { task_id: String, exit_code: i32 },

    #[error("Invalid state transition for task {task_id} from {from:?} to {to:?}")]
    InvalidTransition {
        task_id: String,
        from: InstanceState,
        to: InstanceState,
    },

    #[error("No active instance for task {0}")]
    UnknownInstance(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Another coordinator is active for this project (lock {0:?})")]
    CoordinatorLocked(PathBuf),

    #[error(transparent)]
    Git(#[from] git2::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ParallelError {
    /// Whether the caller should back off and try again later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ParallelError::ResourceExhausted(_) | ParallelError::ConcurrencyBlocked { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ParallelError>;
