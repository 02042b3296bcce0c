//! Configuration for the parallel execution engine
//!
//! Settings live in `.ralph-ui/parallel.yaml` (project) and
//! `~/.ralph-ui/parallel.yaml` (global). Keys are camelCase; snake_case
//! aliases are accepted.

mod manager;

pub use manager::{merge_cli_overrides, CliOverrides, ConfigManager};

use crate::error::{ParallelError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ParallelConfig {
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub resources: ResourceConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub separation: SeparationConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Execution limits and supervision cadence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionConfig {
    /// Maximum instances that are not yet cleaned up
    #[serde(rename = "maxConcurrent", alias = "max_concurrent", default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Supervision loop interval
    #[serde(rename = "pollIntervalMs", alias = "poll_interval_ms", default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Running longer than this flags an instance as stalled (it is not killed)
    #[serde(rename = "maxRunningSecs", alias = "max_running_secs", default = "default_max_running_secs")]
    pub max_running_secs: u64,
    /// Tear down failed workspaces without operator acknowledgement
    #[serde(rename = "autoCleanupFailed", alias = "auto_cleanup_failed", default)]
    pub auto_cleanup_failed: bool,
    /// Persist the instance registry after every state change
    #[serde(rename = "snapshotEnabled", alias = "snapshot_enabled", default = "default_true")]
    pub snapshot_enabled: bool,
}

fn default_max_concurrent() -> usize { 3 }
fn default_poll_interval_ms() -> u64 { 500 }
fn default_max_running_secs() -> u64 { 3600 }
fn default_true() -> bool { true }

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            poll_interval_ms: default_poll_interval_ms(),
            max_running_secs: default_max_running_secs(),
            auto_cleanup_failed: false,
            snapshot_enabled: default_true(),
        }
    }
}

/// Host load thresholds, in percent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceConfig {
    #[serde(rename = "cpuThreshold", alias = "cpu_threshold", default = "default_threshold")]
    pub cpu_threshold: f32,
    #[serde(rename = "memoryThreshold", alias = "memory_threshold", default = "default_threshold")]
    pub memory_threshold: f32,
}

fn default_threshold() -> f32 { 80.0 }

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            cpu_threshold: default_threshold(),
            memory_threshold: default_threshold(),
        }
    }
}

/// Branch and workspace layout
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GitConfig {
    /// Integration target; defaults to the repository's current branch
    #[serde(rename = "primaryBranch", alias = "primary_branch", default)]
    pub primary_branch: Option<String>,
    /// Reserved prefix for ephemeral task branches
    #[serde(rename = "branchPrefix", alias = "branch_prefix", default = "default_branch_prefix")]
    pub branch_prefix: String,
    /// Parent directory of all task workspaces; defaults to `<project>/.worktrees`
    #[serde(rename = "workspaceRoot", alias = "workspace_root", default)]
    pub workspace_root: Option<PathBuf>,
}

fn default_branch_prefix() -> String { "task/".to_string() }

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            primary_branch: None,
            branch_prefix: default_branch_prefix(),
            workspace_root: None,
        }
    }
}

/// Separation heuristic tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeparationConfig {
    #[serde(rename = "safeConfidence", alias = "safe_confidence", default = "default_safe_confidence")]
    pub safe_confidence: u8,
    #[serde(rename = "cautionConfidence", alias = "caution_confidence", default = "default_caution_confidence")]
    pub caution_confidence: u8,
    #[serde(rename = "unsafeConfidence", alias = "unsafe_confidence", default = "default_unsafe_confidence")]
    pub unsafe_confidence: u8,
    /// Largest shared-file count still reported as Caution
    #[serde(rename = "cautionMaxShared", alias = "caution_max_shared", default = "default_caution_max_shared")]
    pub caution_max_shared: usize,
    /// File names that force Unsafe whenever two tasks share them
    #[serde(rename = "criticalFiles", alias = "critical_files", default = "default_critical_files")]
    pub critical_files: Vec<String>,
}

fn default_safe_confidence() -> u8 { 95 }
fn default_caution_confidence() -> u8 { 70 }
fn default_unsafe_confidence() -> u8 { 30 }
fn default_caution_max_shared() -> usize { 2 }

fn default_critical_files() -> Vec<String> {
    [
        "config.yaml",
        "config.yml",
        "config.json",
        "config.toml",
        "settings.json",
        "Cargo.toml",
        "Cargo.lock",
        "package.json",
        "package-lock.json",
        "yarn.lock",
        "pnpm-lock.yaml",
        "go.mod",
        "go.sum",
        "pyproject.toml",
        "requirements.txt",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for SeparationConfig {
    fn default() -> Self {
        Self {
            safe_confidence: default_safe_confidence(),
            caution_confidence: default_caution_confidence(),
            unsafe_confidence: default_unsafe_confidence(),
            caution_max_shared: default_caution_max_shared(),
            critical_files: default_critical_files(),
        }
    }
}

/// External worker process.
///
/// `args` may contain `{task_id}`, `{label}`, `{branch}` and `{workspace}`
/// placeholders, substituted per instance.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct WorkerConfig {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ParallelConfig {
    /// Parent directory for task workspaces
    pub fn workspace_root(&self, project_path: &Path) -> PathBuf {
        match &self.git.workspace_root {
            Some(root) if root.is_absolute() => root.clone(),
            Some(root) => project_path.join(root),
            None => project_path.join(".worktrees"),
        }
    }

    /// Check value ranges. `require_worker` additionally demands a worker command.
    pub fn validate(&self, require_worker: bool) -> Result<()> {
        if self.execution.max_concurrent == 0 {
            return Err(ParallelError::Config(
                "maxConcurrent must be greater than 0".to_string(),
            ));
        }
        if self.execution.poll_interval_ms == 0 {
            return Err(ParallelError::Config(
                "pollIntervalMs must be greater than 0".to_string(),
            ));
        }

        for (name, value) in [
            ("cpuThreshold", self.resources.cpu_threshold),
            ("memoryThreshold", self.resources.memory_threshold),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return Err(ParallelError::Config(format!(
                    "{} must be in (0, 100], got {}",
                    name, value
                )));
            }
        }

        let prefix = &self.git.branch_prefix;
        if prefix.len() < 2 || !prefix.ends_with('/') || prefix.starts_with('/') {
            return Err(ParallelError::Config(format!(
                "branchPrefix must be a non-empty namespace ending in '/', got '{}'",
                prefix
            )));
        }

        let sep = &self.separation;
        if sep.safe_confidence > 100 {
            return Err(ParallelError::Config(
                "safeConfidence must be at most 100".to_string(),
            ));
        }
        if !(sep.safe_confidence > sep.caution_confidence
            && sep.caution_confidence > sep.unsafe_confidence)
        {
            return Err(ParallelError::Config(
                "confidences must be ordered safe > caution > unsafe".to_string(),
            ));
        }

        if require_worker && self.worker.command.trim().is_empty() {
            return Err(ParallelError::Config(
                "worker.command is required".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ParallelConfig::default();
        assert_eq!(config.execution.max_concurrent, 3);
        assert_eq!(config.execution.poll_interval_ms, 500);
        assert_eq!(config.resources.cpu_threshold, 80.0);
        assert_eq!(config.resources.memory_threshold, 80.0);
        assert_eq!(config.git.branch_prefix, "task/");
        assert_eq!(config.separation.safe_confidence, 95);
        assert!(config
            .separation
            .critical_files
            .contains(&"config.yaml".to_string()));
        assert!(config.validate(false).is_ok());
        assert!(config.validate(true).is_err());
    }

    #[test]
    fn test_parse_partial_yaml_with_aliases() {
        let yaml = r#"
execution:
  maxConcurrent: 2
  auto_cleanup_failed: true
git:
  primary_branch: develop
worker:
  command: sh
  args: ["-c", "echo {task_id}"]
"#;
        let config: ParallelConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.execution.max_concurrent, 2);
        assert!(config.execution.auto_cleanup_failed);
        assert_eq!(config.execution.poll_interval_ms, 500);
        assert_eq!(config.git.primary_branch.as_deref(), Some("develop"));
        assert_eq!(config.worker.args.len(), 2);
        assert!(config.validate(true).is_ok());
    }

    #[test]
    fn test_workspace_root_resolution() {
        let project = Path::new("/repo");
        let mut config = ParallelConfig::default();
        assert_eq!(config.workspace_root(project), PathBuf::from("/repo/.worktrees"));

        config.git.workspace_root = Some(PathBuf::from("wt"));
        assert_eq!(config.workspace_root(project), PathBuf::from("/repo/wt"));

        config.git.workspace_root = Some(PathBuf::from("/tmp/wt"));
        assert_eq!(config.workspace_root(project), PathBuf::from("/tmp/wt"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ParallelConfig::default();
        config.execution.max_concurrent = 0;
        assert!(config.validate(false).is_err());

        let mut config = ParallelConfig::default();
        config.resources.cpu_threshold = 120.0;
        assert!(config.validate(false).is_err());

        let mut config = ParallelConfig::default();
        config.git.branch_prefix = "task".to_string();
        assert!(config.validate(false).is_err());

        let mut config = ParallelConfig::default();
        config.separation.caution_confidence = 99;
        assert!(config.validate(false).is_err());
    }
}
