//! Merge and conflict handling for GitManager
//!
//! Contains methods for merging branches, dry-run conflict checks and abort

use git2::{build::CheckoutBuilder, BranchType, Error as GitError, Index, MergeOptions, Signature};

use crate::git::types::MergeResult;
use crate::git::GitManager;

impl GitManager {
    /// Merge a source branch into a target branch inside this working copy.
    ///
    /// The target branch is checked out first. On conflicts the repository is
    /// left in the merging state and the conflicting paths are returned; the
    /// caller decides whether to abort.
    pub fn merge_branch(
        &self,
        source_branch: &str,
        target_branch: &str,
    ) -> Result<MergeResult, GitError> {
        log::info!("[Git] Merging {} into {}", source_branch, target_branch);

        self.checkout_branch(target_branch)?;

        let source_ref = self.repo.find_branch(source_branch, BranchType::Local)?;
        let source_commit = source_ref.get().peel_to_commit()?;
        let annotated_commit = self.repo.find_annotated_commit(source_commit.id())?;

        let (analysis, _preference) = self.repo.merge_analysis(&[&annotated_commit])?;

        if analysis.is_up_to_date() {
            log::info!("[Git] {} already up to date with {}", target_branch, source_branch);
            return Ok(MergeResult {
                success: true,
                message: "Already up to date".to_string(),
                conflict_files: vec![],
                commit_id: self.head_revision(),
                fast_forward: false,
            });
        }

        if analysis.is_fast_forward() {
            log::info!("[Git] Fast-forward merge possible");

            // Untracked files the branch would overwrite fail the checkout
            // before anything is written or the ref moves
            let mut checkout_opts = CheckoutBuilder::new();
            checkout_opts.safe();
            self.repo
                .checkout_tree(source_commit.as_object(), Some(&mut checkout_opts))?;

            let target_ref_name = format!("refs/heads/{}", target_branch);
            let mut target_ref = self.repo.find_reference(&target_ref_name)?;
            target_ref.set_target(
                source_commit.id(),
                &format!("Fast-forward merge {} into {}", source_branch, target_branch),
            )?;

            return Ok(MergeResult {
                success: true,
                message: format!("Fast-forward merged {} into {}", source_branch, target_branch),
                conflict_files: vec![],
                commit_id: Some(source_commit.id().to_string()),
                fast_forward: true,
            });
        }

        let mut merge_opts = MergeOptions::new();
        let mut checkout_opts = CheckoutBuilder::new();
        checkout_opts.safe();

        self.repo.merge(
            &[&annotated_commit],
            Some(&mut merge_opts),
            Some(&mut checkout_opts),
        )?;

        let mut index = self.repo.index()?;
        if index.has_conflicts() {
            let conflict_files = conflict_paths(&index)?;
            log::warn!("[Git] Merge has conflicts: {:?}", conflict_files);
            return Ok(MergeResult {
                success: false,
                message: format!("Merge conflicts in {} file(s)", conflict_files.len()),
                conflict_files,
                commit_id: None,
                fast_forward: false,
            });
        }

        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;

        let head_commit = self.repo.head()?.peel_to_commit()?;
        let signature = self
            .repo
            .signature()
            .or_else(|_| Signature::now("Ralph Parallel", "ralph@example.com"))?;

        let merge_commit = self.repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            &format!("Merge branch '{}' into '{}'", source_branch, target_branch),
            &tree,
            &[&head_commit, &source_commit],
        )?;

        self.repo.cleanup_state()?;

        log::info!("[Git] Merge successful: {}", merge_commit);

        Ok(MergeResult {
            success: true,
            message: format!("Successfully merged {} into {}", source_branch, target_branch),
            conflict_files: vec![],
            commit_id: Some(merge_commit.to_string()),
            fast_forward: false,
        })
    }

    /// Abort an ongoing merge, restoring HEAD, index and working copy
    pub fn merge_abort(&self) -> Result<(), GitError> {
        log::info!("[Git] Aborting merge");

        let head = self.repo.head()?.peel_to_commit()?;
        self.repo
            .reset(head.as_object(), git2::ResetType::Hard, None)?;

        self.repo.cleanup_state()?;

        Ok(())
    }

    /// List the files that would conflict if `source_branch` were merged into
    /// `target_branch`. Performed entirely in memory; nothing is checked out.
    pub fn check_merge_conflicts(
        &self,
        source_branch: &str,
        target_branch: &str,
    ) -> Result<Vec<String>, GitError> {
        let source_commit = self
            .repo
            .find_branch(source_branch, BranchType::Local)?
            .get()
            .peel_to_commit()?;
        let target_commit = self
            .repo
            .find_branch(target_branch, BranchType::Local)?
            .get()
            .peel_to_commit()?;

        let mut merge_opts = MergeOptions::new();
        merge_opts.fail_on_conflict(false);
        let index = self
            .repo
            .merge_commits(&target_commit, &source_commit, Some(&merge_opts))?;

        if !index.has_conflicts() {
            return Ok(Vec::new());
        }
        conflict_paths(&index)
    }
}

/// Collect the path of every conflicted entry, once per path
fn conflict_paths(index: &Index) -> Result<Vec<String>, GitError> {
    let mut conflict_files = Vec::new();
    for conflict in index.conflicts()? {
        let conflict = conflict?;
        if let Some(entry) = conflict.our.or(conflict.their).or(conflict.ancestor) {
            let path = String::from_utf8_lossy(&entry.path).to_string();
            if !conflict_files.contains(&path) {
                conflict_files.push(path);
            }
        }
    }
    Ok(conflict_files)
}
