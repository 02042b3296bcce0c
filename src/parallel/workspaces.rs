//! Workspace Manager for Parallel Execution
//!
//! Each task instance works in its own git worktree, bound to an ephemeral
//! branch under a reserved prefix. All task worktrees live beneath a single
//! workspace root; paths outside it are never created or destroyed.

use crate::config::ParallelConfig;
use crate::error::{ParallelError, Result};
use crate::git::GitManager;
use crate::utils::{ensure_dir, sanitize_branch_component, sanitize_path_component};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// An isolated working copy bound to one branch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub path: PathBuf,
    pub branch_name: String,
    pub head_revision: Option<String>,
    pub is_primary: bool,
}

/// Read-only introspection of a workspace
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceStatus {
    pub branch: Option<String>,
    pub uncommitted_count: usize,
    pub untracked_count: usize,
    /// Commits on the workspace branch not yet on the primary branch
    pub ahead_count: usize,
    /// Commits on the primary branch not yet on the workspace branch
    pub behind_count: usize,
    pub is_clean: bool,
}

/// Creates, lists, inspects and destroys task workspaces
pub struct WorkspaceManager {
    project_path: PathBuf,
    workspace_root: PathBuf,
    branch_prefix: String,
    primary_branch: String,
}

impl WorkspaceManager {
    /// Open the repository at `project_path` and prepare the workspace root
    pub fn new(project_path: &Path, config: &ParallelConfig) -> Result<Self> {
        let git = GitManager::new(project_path)?;
        let primary_branch = config
            .git
            .primary_branch
            .clone()
            .unwrap_or_else(|| git.get_default_branch_name());

        if !git.branch_exists(&primary_branch) {
            return Err(ParallelError::Config(format!(
                "primary branch '{}' does not exist",
                primary_branch
            )));
        }

        let workspace_root = config.workspace_root(project_path);
        ensure_dir(&workspace_root)?;
        let workspace_root = workspace_root.canonicalize()?;

        Ok(Self {
            project_path: git.workdir()?,
            workspace_root,
            branch_prefix: config.git.branch_prefix.clone(),
            primary_branch,
        })
    }

    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn primary_branch(&self) -> &str {
        &self.primary_branch
    }

    pub fn branch_prefix(&self) -> &str {
        &self.branch_prefix
    }

    /// Reserved branch name for a task: `<prefix><task id>`
    pub fn branch_name_for(&self, task_id: &str) -> String {
        format!("{}{}", self.branch_prefix, sanitize_branch_component(task_id))
    }

    /// Workspace directory for a task
    pub fn path_for(&self, task_id: &str) -> PathBuf {
        self.workspace_root.join(sanitize_path_component(task_id))
    }

    /// Whether `branch` falls under the reserved task namespace
    pub fn is_task_branch(&self, branch: &str) -> bool {
        branch.len() > self.branch_prefix.len() && branch.starts_with(&self.branch_prefix)
    }

    /// Materialize a working copy for `task_id` on a new `branch_name` forked
    /// from `base_branch`
    pub fn create_workspace(
        &self,
        task_id: &str,
        branch_name: &str,
        base_branch: &str,
    ) -> Result<Workspace> {
        let creation_error = |reason: String| ParallelError::WorkspaceCreation {
            task_id: task_id.to_string(),
            reason,
        };

        if !self.is_task_branch(branch_name) || branch_name == self.primary_branch {
            return Err(creation_error(format!(
                "branch '{}' is outside the reserved '{}' namespace",
                branch_name, self.branch_prefix
            )));
        }

        let path = self.path_for(task_id);
        self.guard_path(&path)?;
        if path.exists() {
            return Err(creation_error(format!("path {:?} already exists", path)));
        }

        let git = GitManager::new(&self.project_path)?;
        if git.has_pending_operation() {
            return Err(creation_error(
                "primary workspace has an operation in progress".to_string(),
            ));
        }
        if git.branch_exists(branch_name) {
            return Err(creation_error(format!("branch '{}' already exists", branch_name)));
        }
        if !git.branch_exists(base_branch) {
            return Err(creation_error(format!(
                "base branch '{}' does not exist",
                base_branch
            )));
        }

        git.create_branch_from(branch_name, base_branch)
            .map_err(|e| creation_error(format!("failed to create branch: {}", e)))?;

        let info = match git.create_worktree(branch_name, &path) {
            Ok(info) => info,
            Err(e) => {
                // Never leave a half-created workspace behind
                if let Err(del) = git.delete_branch(branch_name) {
                    log::warn!(
                        "[WorkspaceManager] Failed to roll back branch {}: {}",
                        branch_name,
                        del
                    );
                }
                if path.exists() {
                    let _ = std::fs::remove_dir_all(&path);
                }
                return Err(creation_error(format!("failed to create worktree: {}", e)));
            }
        };

        log::info!(
            "[WorkspaceManager] Created workspace for task {} at {:?} on branch {}",
            task_id,
            path,
            branch_name
        );

        Ok(Workspace {
            path,
            branch_name: branch_name.to_string(),
            head_revision: info.head_revision,
            is_primary: false,
        })
    }

    /// The long-lived integration workspace
    pub fn primary_workspace(&self) -> Result<Workspace> {
        let git = GitManager::new(&self.project_path)?;
        Ok(Workspace {
            path: self.project_path.clone(),
            branch_name: git
                .current_branch_name()
                .unwrap_or_else(|| self.primary_branch.clone()),
            head_revision: git.head_revision(),
            is_primary: true,
        })
    }

    /// All workspaces, primary first
    pub fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        let git = GitManager::new(&self.project_path)?;

        let mut workspaces = vec![self.primary_workspace()?];
        for info in git.list_worktrees()? {
            workspaces.push(Workspace {
                path: info.path,
                branch_name: info.branch.unwrap_or_default(),
                head_revision: info.head_revision,
                is_primary: false,
            });
        }

        Ok(workspaces)
    }

    /// Find the workspace created for a task, if it still exists
    pub fn workspace_for_task(&self, task_id: &str) -> Result<Option<Workspace>> {
        let branch = self.branch_name_for(task_id);
        Ok(self
            .list_workspaces()?
            .into_iter()
            .find(|w| !w.is_primary && w.branch_name == branch))
    }

    /// Destroy a workspace directory and delete its branch.
    ///
    /// Without `force`, refuses when the workspace has uncommitted changes or
    /// commits that are not on the primary branch. Removing a workspace that
    /// is already gone is a no-op.
    pub fn remove_workspace(&self, workspace: &Workspace, force: bool) -> Result<()> {
        if workspace.is_primary {
            return Err(ParallelError::Security {
                path: workspace.path.clone(),
                root: self.workspace_root.clone(),
            });
        }
        self.guard_path(&workspace.path)?;

        let git = GitManager::new(&self.project_path)?;

        if !force && workspace.path.exists() {
            let status = self.get_status(workspace)?;
            if status.uncommitted_count > 0 || status.untracked_count > 0 {
                return Err(ParallelError::WorkspaceNotClean {
                    path: workspace.path.clone(),
                    reason: format!(
                        "{} uncommitted and {} untracked change(s)",
                        status.uncommitted_count, status.untracked_count
                    ),
                });
            }
            if status.ahead_count > 0 {
                return Err(ParallelError::WorkspaceNotClean {
                    path: workspace.path.clone(),
                    reason: format!(
                        "{} commit(s) not integrated into {}",
                        status.ahead_count, self.primary_branch
                    ),
                });
            }
        } else if !force && git.branch_exists(&workspace.branch_name) {
            let (ahead, _) = git.ahead_behind(&workspace.branch_name, &self.primary_branch)?;
            if ahead > 0 {
                return Err(ParallelError::WorkspaceNotClean {
                    path: workspace.path.clone(),
                    reason: format!("{} commit(s) not integrated into {}", ahead, self.primary_branch),
                });
            }
        }

        let removed = git.remove_worktree(&workspace.path)?;
        if workspace.path.exists() {
            std::fs::remove_dir_all(&workspace.path)?;
        }
        if !removed {
            git.prune_orphaned_worktrees()?;
        }

        if self.is_task_branch(&workspace.branch_name) && git.branch_exists(&workspace.branch_name) {
            git.delete_branch(&workspace.branch_name)?;
        }

        log::info!(
            "[WorkspaceManager] Removed workspace {:?} (branch {})",
            workspace.path,
            workspace.branch_name
        );
        Ok(())
    }

    /// Cleanliness and divergence of a workspace relative to the primary branch
    pub fn get_status(&self, workspace: &Workspace) -> Result<WorkspaceStatus> {
        let git = GitManager::new(&workspace.path)?;
        let counts = git.status_counts()?;
        let branch = git.current_branch_name();

        let (ahead_count, behind_count) = match &branch {
            Some(name) if name != &self.primary_branch => {
                git.ahead_behind(name, &self.primary_branch)?
            }
            _ => (0, 0),
        };

        Ok(WorkspaceStatus {
            branch,
            uncommitted_count: counts.uncommitted,
            untracked_count: counts.untracked,
            ahead_count,
            behind_count,
            is_clean: counts.is_clean(),
        })
    }

    /// Reject any path that does not resolve strictly inside the workspace root
    pub fn guard_path(&self, path: &Path) -> Result<PathBuf> {
        let escape = || ParallelError::Security {
            path: path.to_path_buf(),
            root: self.workspace_root.clone(),
        };

        let resolved = if path.exists() {
            path.canonicalize()?
        } else {
            let parent = path.parent().ok_or_else(escape)?;
            let name = path.file_name().ok_or_else(escape)?;
            if !parent.exists() {
                return Err(escape());
            }
            parent.canonicalize()?.join(name)
        };

        if resolved == self.workspace_root || !resolved.starts_with(&self.workspace_root) {
            log::warn!(
                "[WorkspaceManager] Rejected path {:?} outside {:?}",
                path,
                self.workspace_root
            );
            return Err(escape());
        }

        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::{Repository, Signature};
    use std::fs;
    use tempfile::TempDir;

    fn setup_test_repo() -> (TempDir, WorkspaceManager) {
        let temp_dir = TempDir::new().unwrap();
        let repo_path = temp_dir.path();
        let repo = Repository::init(repo_path).unwrap();

        let sig = Signature::now("Test User", "test@example.com").unwrap();
        let tree_id = {
            let mut index = repo.index().unwrap();
            fs::write(repo_path.join("test.txt"), "Hello, World!").unwrap();
            index.add_path(Path::new("test.txt")).unwrap();
            index.write().unwrap();
            index.write_tree().unwrap()
        };
        let tree = repo.find_tree(tree_id).unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
            .unwrap();

        let manager = WorkspaceManager::new(repo_path, &ParallelConfig::default()).unwrap();
        (temp_dir, manager)
    }

    fn commit_in(path: &Path, file: &str, content: &str) {
        let repo = Repository::open(path).unwrap();
        fs::write(path.join(file), content).unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new(file)).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now("Test User", "test@example.com").unwrap();
        let parent = repo.head().unwrap().peel_to_commit().unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "work", &tree, &[&parent])
            .unwrap();
    }

    #[test]
    fn test_create_and_list_workspace() {
        let (_temp_dir, manager) = setup_test_repo();
        let primary = manager.primary_branch().to_string();
        let branch = manager.branch_name_for("T-1");
        assert_eq!(branch, "task/T-1");

        let ws = manager.create_workspace("T-1", &branch, &primary).unwrap();
        assert!(ws.path.join("test.txt").exists());
        assert!(!ws.is_primary);
        assert!(ws.head_revision.is_some());

        let all = manager.list_workspaces().unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].is_primary);
        assert_eq!(all.iter().filter(|w| w.is_primary).count(), 1);
        assert_eq!(all[1].branch_name, "task/T-1");

        assert_eq!(manager.workspace_for_task("T-1").unwrap().unwrap().path, all[1].path);
    }

    #[test]
    fn test_create_rejects_collisions() {
        let (_temp_dir, manager) = setup_test_repo();
        let primary = manager.primary_branch().to_string();

        manager.create_workspace("T-1", "task/T-1", &primary).unwrap();

        // Same task again: path and branch both exist
        assert!(matches!(
            manager.create_workspace("T-1", "task/T-1", &primary),
            Err(ParallelError::WorkspaceCreation { .. })
        ));
        // Branch collision from another task
        assert!(matches!(
            manager.create_workspace("T-2", "task/T-1", &primary),
            Err(ParallelError::WorkspaceCreation { .. })
        ));
        // Outside the reserved namespace
        assert!(matches!(
            manager.create_workspace("T-3", "feature/x", &primary),
            Err(ParallelError::WorkspaceCreation { .. })
        ));
        // Missing base branch
        assert!(matches!(
            manager.create_workspace("T-4", "task/T-4", "does-not-exist"),
            Err(ParallelError::WorkspaceCreation { .. })
        ));
        assert!(!manager.path_for("T-4").exists());
    }

    #[test]
    fn test_round_trip_leaves_nothing_behind() {
        let (temp_dir, manager) = setup_test_repo();
        let primary = manager.primary_branch().to_string();

        let ws = manager.create_workspace("T-1", "task/T-1", &primary).unwrap();
        fs::write(ws.path.join("scratch.txt"), "dirty").unwrap();

        manager.remove_workspace(&ws, true).unwrap();

        assert!(!ws.path.exists());
        let git = GitManager::new(temp_dir.path()).unwrap();
        assert!(!git.branch_exists("task/T-1"));
        assert!(git.list_worktrees().unwrap().is_empty());

        // Second removal is a no-op
        manager.remove_workspace(&ws, true).unwrap();
    }

    #[test]
    fn test_remove_without_force_refuses_dirty_or_unintegrated() {
        let (_temp_dir, manager) = setup_test_repo();
        let primary = manager.primary_branch().to_string();

        let ws = manager.create_workspace("T-1", "task/T-1", &primary).unwrap();
        fs::write(ws.path.join("test.txt"), "changed").unwrap();
        assert!(matches!(
            manager.remove_workspace(&ws, false),
            Err(ParallelError::WorkspaceNotClean { .. })
        ));

        commit_in(&ws.path, "test.txt", "changed");
        assert!(matches!(
            manager.remove_workspace(&ws, false),
            Err(ParallelError::WorkspaceNotClean { .. })
        ));
        assert!(ws.path.exists());

        // A clean workspace without new commits is removed
        let clean = manager.create_workspace("T-2", "task/T-2", &primary).unwrap();
        manager.remove_workspace(&clean, false).unwrap();
        assert!(!clean.path.exists());
    }

    #[test]
    fn test_get_status_reports_divergence() {
        let (_temp_dir, manager) = setup_test_repo();
        let primary = manager.primary_branch().to_string();
        let ws = manager.create_workspace("T-1", "task/T-1", &primary).unwrap();

        let status = manager.get_status(&ws).unwrap();
        assert_eq!(status.branch.as_deref(), Some("task/T-1"));
        assert!(status.is_clean);
        assert_eq!((status.ahead_count, status.behind_count), (0, 0));

        commit_in(&ws.path, "new.txt", "new");
        fs::write(ws.path.join("untracked.txt"), "u").unwrap();

        let status = manager.get_status(&ws).unwrap();
        assert_eq!(status.ahead_count, 1);
        assert_eq!(status.untracked_count, 1);
        assert!(!status.is_clean);
    }

    #[test]
    fn test_guard_path_rejects_escapes() {
        let (temp_dir, manager) = setup_test_repo();

        assert!(manager.guard_path(&manager.path_for("ok")).is_ok());
        for bad in [
            temp_dir.path().join("test.txt"),
            manager.workspace_root().join("..").join("elsewhere"),
            manager.workspace_root().to_path_buf(),
            PathBuf::from("/"),
        ] {
            assert!(
                matches!(manager.guard_path(&bad), Err(ParallelError::Security { .. })),
                "{:?} should be rejected",
                bad
            );
        }

        let outside = Workspace {
            path: temp_dir.path().to_path_buf(),
            branch_name: "task/evil".to_string(),
            head_revision: None,
            is_primary: false,
        };
        assert!(matches!(
            manager.remove_workspace(&outside, true),
            Err(ParallelError::Security { .. })
        ));
        assert!(temp_dir.path().join("test.txt").exists());
    }

    #[test]
    fn test_primary_cannot_be_removed() {
        let (_temp_dir, manager) = setup_test_repo();
        let primary = manager.primary_workspace().unwrap();
        assert!(primary.is_primary);
        assert!(matches!(
            manager.remove_workspace(&primary, true),
            Err(ParallelError::Security { .. })
        ));
    }
}
