//! Branch operations for GitManager
//!
//! Contains methods for creating, deleting, inspecting and checking out branches

use git2::{Branch, BranchType, Error as GitError, Oid};

use crate::git::types::BranchInfo;
use crate::git::GitManager;

impl GitManager {
    /// Create a new branch forked from the tip of `base_branch`.
    /// Fails if `name` already exists.
    pub fn create_branch_from(&self, name: &str, base_branch: &str) -> Result<BranchInfo, GitError> {
        let base = self.repo.find_branch(base_branch, BranchType::Local)?;
        let base_commit = base.get().peel_to_commit()?;
        let branch = self.repo.branch(name, &base_commit, false)?;

        log::debug!(
            "[Git] Created branch {} from {} at {}",
            name,
            base_branch,
            base_commit.id()
        );
        self.branch_to_info(&branch)
    }

    /// Check whether a local branch exists
    pub fn branch_exists(&self, name: &str) -> bool {
        self.repo.find_branch(name, BranchType::Local).is_ok()
    }

    /// Delete a local branch
    pub fn delete_branch(&self, name: &str) -> Result<(), GitError> {
        let mut branch = self.repo.find_branch(name, BranchType::Local)?;
        branch.delete()?;
        Ok(())
    }

    /// Get all local branches
    pub fn list_branches(&self) -> Result<Vec<BranchInfo>, GitError> {
        let branches = self.repo.branches(Some(BranchType::Local))?;

        let mut result = Vec::new();
        for branch in branches {
            let (branch, _) = branch?;
            result.push(self.branch_to_info(&branch)?);
        }

        Ok(result)
    }

    /// Name of the branch HEAD points at, if HEAD is a branch
    pub fn current_branch_name(&self) -> Option<String> {
        let head = self.repo.head().ok()?;
        if !head.is_branch() {
            return None;
        }
        head.shorthand().map(|s| s.to_string())
    }

    /// Commit id HEAD points at, if any commit exists
    pub fn head_revision(&self) -> Option<String> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.target())
            .map(|oid| oid.to_string())
    }

    /// Commit id at the tip of a local branch
    pub fn branch_tip(&self, name: &str) -> Result<Oid, GitError> {
        let branch = self.repo.find_branch(name, BranchType::Local)?;
        Ok(branch.get().peel_to_commit()?.id())
    }

    /// Number of commits `branch` has that `upstream` lacks, and vice versa
    pub fn ahead_behind(&self, branch: &str, upstream: &str) -> Result<(usize, usize), GitError> {
        let local = self.branch_tip(branch)?;
        let other = self.branch_tip(upstream)?;
        self.repo.graph_ahead_behind(local, other)
    }

    /// Checkout a branch
    pub fn checkout_branch(&self, name: &str) -> Result<(), GitError> {
        let obj = self.repo.revparse_single(&format!("refs/heads/{}", name))?;

        self.repo.checkout_tree(&obj, None)?;
        self.repo.set_head(&format!("refs/heads/{}", name))?;

        Ok(())
    }

    /// Convert a Branch to BranchInfo
    pub(crate) fn branch_to_info(&self, branch: &Branch) -> Result<BranchInfo, GitError> {
        let name = branch.name()?.unwrap_or("").to_string();
        let is_head = branch.is_head();
        let commit_id = branch.get().peel_to_commit()?.id().to_string();

        Ok(BranchInfo {
            name,
            is_head,
            commit_id,
        })
    }

    /// Get the default branch name for this repository.
    ///
    /// Resolution order:
    /// 1. Current HEAD branch (if HEAD points to a branch)
    /// 2. First existing common default branch ("main", "master")
    /// 3. Fallback to "main"
    pub fn get_default_branch_name(&self) -> String {
        if let Some(name) = self.current_branch_name() {
            return name;
        }

        for name in &["main", "master"] {
            if self.branch_exists(name) {
                return (*name).to_string();
            }
        }

        "main".to_string()
    }
}
