//! Worktree management for GitManager
//!
//! Contains methods for creating, listing, removing and pruning worktrees

use git2::{BranchType, Error as GitError, Repository, Worktree, WorktreeAddOptions, WorktreePruneOptions};
use std::path::Path;

use crate::git::types::WorktreeInfo;
use crate::git::GitManager;

impl GitManager {
    /// Create a worktree at `path` checked out on an existing local `branch`
    pub fn create_worktree(&self, branch: &str, path: &Path) -> Result<WorktreeInfo, GitError> {
        let branch_ref = self.repo.find_branch(branch, BranchType::Local)?;

        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(branch_ref.get()));

        // Branch names like "task/uuid" would create ".git/worktrees/task/uuid" which fails
        let worktree_name = worktree_name_for(branch);

        let worktree = self.repo.worktree(&worktree_name, path, Some(&opts))?;

        self.worktree_to_info(&worktree)
    }

    /// List all linked worktrees (the main working copy is not included)
    pub fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, GitError> {
        let worktrees = self.repo.worktrees()?;

        let mut result = Vec::new();
        for name in worktrees.iter().flatten() {
            if let Ok(worktree) = self.repo.find_worktree(name) {
                result.push(self.worktree_to_info(&worktree)?);
            }
        }

        Ok(result)
    }

    /// Remove the worktree located at `path`: its metadata in `.git/worktrees`
    /// and its working directory. Returns false when no worktree matches.
    pub fn remove_worktree(&self, path: &Path) -> Result<bool, GitError> {
        let worktrees = self.repo.worktrees()?;

        for name in worktrees.iter().flatten() {
            if let Ok(worktree) = self.repo.find_worktree(name) {
                if same_path(worktree.path(), path) {
                    let mut opts = WorktreePruneOptions::new();
                    opts.valid(true).working_tree(true);
                    worktree.prune(Some(&mut opts))?;
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }

    /// Prune orphaned worktrees (where the physical directory no longer exists)
    /// This cleans up stale entries in .git/worktrees/
    pub fn prune_orphaned_worktrees(&self) -> Result<u32, GitError> {
        let worktrees = self.repo.worktrees()?;
        let mut pruned_count = 0;

        for name in worktrees.iter().flatten() {
            if let Ok(worktree) = self.repo.find_worktree(name) {
                let worktree_path = worktree.path();
                if !worktree_path.exists() {
                    log::info!(
                        "[Git] Pruning orphaned worktree '{}' (path {:?} no longer exists)",
                        name,
                        worktree_path
                    );
                    if let Err(e) = worktree.prune(None) {
                        log::warn!("[Git] Failed to prune worktree '{}': {}", name, e);
                    } else {
                        pruned_count += 1;
                    }
                }
            }
        }

        Ok(pruned_count)
    }

    /// Convert a Worktree to WorktreeInfo
    pub(crate) fn worktree_to_info(&self, worktree: &Worktree) -> Result<WorktreeInfo, GitError> {
        let name = worktree.name().unwrap_or("").to_string();
        let path = worktree.path().to_path_buf();
        let is_locked = worktree
            .is_locked()
            .map(|status| !matches!(status, git2::WorktreeLockStatus::Unlocked))
            .unwrap_or(false);

        let (branch, head_revision) = match Repository::open(worktree.path()) {
            Ok(wt_repo) => match wt_repo.head() {
                Ok(head) => {
                    let branch = if head.is_branch() {
                        head.shorthand().map(|s| s.to_string())
                    } else {
                        None
                    };
                    (branch, head.target().map(|oid| oid.to_string()))
                }
                Err(_) => (None, None),
            },
            Err(_) => (None, None),
        };

        Ok(WorktreeInfo {
            name,
            path,
            branch,
            head_revision,
            is_locked,
        })
    }
}

/// Name of the `.git/worktrees/<name>` entry for a branch
fn worktree_name_for(branch: &str) -> String {
    branch.replace('/', "-")
}

/// Compare two paths, resolving symlinks when both exist
fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => {
            let a = a.to_string_lossy();
            let b = b.to_string_lossy();
            a.trim_end_matches('/') == b.trim_end_matches('/')
        }
    }
}
