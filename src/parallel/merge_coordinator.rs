//! Merge Coordinator for Parallel Execution
//!
//! Integrates completed task branches into the primary branch, one at a time.
//! A conflicting merge is aborted so the primary branch is left exactly as it
//! was; the task workspace is left alone for manual inspection.

use crate::error::{ParallelError, Result};
use crate::git::GitManager;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Result of one merge attempt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MergeOutcome {
    pub success: bool,
    pub conflicting_files: Vec<String>,
    pub commit_id: Option<String>,
    pub fast_forward: bool,
    pub message: String,
}

impl MergeOutcome {
    fn conflicted(files: Vec<String>, message: String) -> Self {
        Self {
            success: false,
            conflicting_files: files,
            commit_id: None,
            fast_forward: false,
            message,
        }
    }
}

/// Information about merge conflicts awaiting resolution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInfo {
    pub task_id: String,
    pub branch_name: String,
    pub conflicting_files: Vec<String>,
    pub detected_at: String,
}

/// Coordinator for merging task branches into the primary branch
pub struct MergeCoordinator {
    project_path: PathBuf,
    target_branch: String,
    conflict_queue: Vec<ConflictInfo>,
}

impl MergeCoordinator {
    pub fn new(project_path: &Path, target_branch: &str) -> Self {
        Self {
            project_path: project_path.to_path_buf(),
            target_branch: target_branch.to_string(),
            conflict_queue: Vec::new(),
        }
    }

    pub fn target_branch(&self) -> &str {
        &self.target_branch
    }

    /// Conflicts not yet cleaned up
    pub fn conflicts(&self) -> &[ConflictInfo] {
        &self.conflict_queue
    }

    /// Clear a conflict from the queue (after resolution)
    pub fn clear_conflict(&mut self, task_id: &str) {
        self.conflict_queue.retain(|c| c.task_id != task_id);
    }

    /// Files that would conflict if `branch` were merged now.
    /// Nothing in the primary workspace is touched.
    pub fn check_can_merge(&self, branch: &str) -> Result<Vec<String>> {
        let git = GitManager::new(&self.project_path)?;
        Ok(git.check_merge_conflicts(branch, &self.target_branch)?)
    }

    /// Merge `branch` into the target branch.
    ///
    /// Takes `&mut self`, so one coordinator never runs two merges at once.
    /// Returns `Ok` with `success == false` on conflicts (an expected outcome);
    /// `Err` means the merge could not be attempted at all.
    pub fn merge(&mut self, task_id: &str, branch: &str) -> Result<MergeOutcome> {
        log::info!(
            "[MergeCoordinator] Merging task {} from branch {} into {}",
            task_id,
            branch,
            self.target_branch
        );

        let git = GitManager::new(&self.project_path)?;
        self.ensure_primary_ready(&git)?;

        let before = git.head_revision();

        // Dry run first so a conflicting merge never touches the working copy
        let predicted = git.check_merge_conflicts(branch, &self.target_branch)?;
        if !predicted.is_empty() {
            return Ok(self.record_conflict(task_id, branch, predicted));
        }

        let result = match git.merge_branch(branch, &self.target_branch) {
            Ok(result) => result,
            Err(e) => {
                if git.has_pending_operation() {
                    if let Err(abort_err) = git.merge_abort() {
                        log::error!("[MergeCoordinator] Failed to abort merge: {}", abort_err);
                    }
                }
                log::error!("[MergeCoordinator] Merge of {} failed: {}", branch, e);
                return Err(e.into());
            }
        };

        if !result.success {
            if let Err(abort_err) = git.merge_abort() {
                log::error!("[MergeCoordinator] Failed to abort merge: {}", abort_err);
                return Err(abort_err.into());
            }
            if git.head_revision() != before {
                log::error!(
                    "[MergeCoordinator] Primary HEAD moved during aborted merge of {}",
                    branch
                );
            }
            return Ok(self.record_conflict(task_id, branch, result.conflict_files));
        }

        log::info!(
            "[MergeCoordinator] Successfully merged task {}: {}",
            task_id,
            result.message
        );

        Ok(MergeOutcome {
            success: true,
            conflicting_files: Vec::new(),
            commit_id: result.commit_id,
            fast_forward: result.fast_forward,
            message: result.message,
        })
    }

    /// The primary workspace must be on the target branch with no tracked
    /// changes and no operation in progress. Untracked files are tolerated.
    fn ensure_primary_ready(&self, git: &GitManager) -> Result<()> {
        let not_clean = |reason: String| ParallelError::WorkspaceNotClean {
            path: self.project_path.clone(),
            reason,
        };

        if git.has_pending_operation() {
            return Err(not_clean("an operation in progress".to_string()));
        }

        match git.current_branch_name() {
            Some(current) if current == self.target_branch => {}
            Some(current) => {
                return Err(not_clean(format!(
                    "branch '{}' checked out instead of '{}'",
                    current, self.target_branch
                )))
            }
            None => return Err(not_clean("a detached HEAD".to_string())),
        }

        let counts = git.status_counts()?;
        if counts.uncommitted > 0 {
            return Err(not_clean(format!(
                "{} uncommitted change(s)",
                counts.uncommitted
            )));
        }

        Ok(())
    }

    fn record_conflict(&mut self, task_id: &str, branch: &str, files: Vec<String>) -> MergeOutcome {
        log::warn!(
            "[MergeCoordinator] Conflict detected for task {}: {:?}",
            task_id,
            files
        );

        self.clear_conflict(task_id);
        self.conflict_queue.push(ConflictInfo {
            task_id: task_id.to_string(),
            branch_name: branch.to_string(),
            conflicting_files: files.clone(),
            detected_at: chrono::Utc::now().to_rfc3339(),
        });

        let message = format!("Merge conflicts in {} file(s)", files.len());
        MergeOutcome::conflicted(files, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::{Repository, Signature};
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        base: String,
    }

    fn commit(path: &Path, file: &str, content: &str) {
        let repo = Repository::open(path).unwrap();
        fs::write(path.join(file), content).unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new(file)).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now("Test User", "test@example.com").unwrap();
        let parents: Vec<git2::Commit> = repo
            .head()
            .ok()
            .and_then(|h| h.peel_to_commit().ok())
            .into_iter()
            .collect();
        let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, "commit", &tree, &parent_refs)
            .unwrap();
    }

    fn setup() -> Fixture {
        let dir = TempDir::new().unwrap();
        Repository::init(dir.path()).unwrap();
        commit(dir.path(), "shared.txt", "base\n");
        let base = GitManager::new(dir.path()).unwrap().get_default_branch_name();
        Fixture { dir, base }
    }

    fn task_branch(fx: &Fixture, name: &str) -> PathBuf {
        let git = GitManager::new(fx.dir.path()).unwrap();
        git.create_branch_from(name, &fx.base).unwrap();
        let path = fx.dir.path().join(name.replace('/', "-"));
        git.create_worktree(name, &path).unwrap();
        path
    }

    #[test]
    fn test_merge_success() {
        let fx = setup();
        let wt = task_branch(&fx, "task/a");
        commit(&wt, "a.txt", "a");

        let mut coordinator = MergeCoordinator::new(fx.dir.path(), &fx.base);
        let outcome = coordinator.merge("a", "task/a").unwrap();

        assert!(outcome.success);
        assert!(outcome.conflicting_files.is_empty());
        assert!(fx.dir.path().join("a.txt").exists());
        assert!(coordinator.conflicts().is_empty());
    }

    #[test]
    fn test_conflict_leaves_primary_unchanged() {
        let fx = setup();
        let wt = task_branch(&fx, "task/b");
        commit(&wt, "shared.txt", "from task\n");
        commit(fx.dir.path(), "shared.txt", "from primary\n");

        let git = GitManager::new(fx.dir.path()).unwrap();
        let before = git.head_revision();

        let mut coordinator = MergeCoordinator::new(fx.dir.path(), &fx.base);
        assert_eq!(
            coordinator.check_can_merge("task/b").unwrap(),
            vec!["shared.txt".to_string()]
        );

        let outcome = coordinator.merge("b", "task/b").unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.conflicting_files, vec!["shared.txt".to_string()]);

        assert_eq!(git.head_revision(), before);
        assert!(!git.has_pending_operation());
        assert_eq!(
            fs::read_to_string(fx.dir.path().join("shared.txt")).unwrap(),
            "from primary\n"
        );
        assert!(wt.exists());
        assert_eq!(coordinator.conflicts().len(), 1);

        coordinator.clear_conflict("b");
        assert!(coordinator.conflicts().is_empty());
    }

    #[test]
    fn test_dirty_primary_is_refused() {
        let fx = setup();
        let wt = task_branch(&fx, "task/c");
        commit(&wt, "c.txt", "c");
        fs::write(fx.dir.path().join("shared.txt"), "local edit\n").unwrap();

        let mut coordinator = MergeCoordinator::new(fx.dir.path(), &fx.base);
        assert!(matches!(
            coordinator.merge("c", "task/c"),
            Err(ParallelError::WorkspaceNotClean { .. })
        ));
        assert!(!fx.dir.path().join("c.txt").exists());
    }

    #[test]
    fn test_missing_branch_is_an_error() {
        let fx = setup();
        let mut coordinator = MergeCoordinator::new(fx.dir.path(), &fx.base);
        assert!(matches!(
            coordinator.merge("x", "task/missing"),
            Err(ParallelError::Git(_))
        ));
    }
}
