//! Status operations for GitManager
//!
//! Contains methods for measuring how clean a working copy is

use git2::{Error as GitError, Status, StatusOptions};

use crate::git::types::StatusCounts;
use crate::git::GitManager;

impl GitManager {
    /// Count uncommitted (tracked) and untracked entries in the working copy.
    /// An untracked directory counts once; ignored files are skipped.
    pub fn status_counts(&self) -> Result<StatusCounts, GitError> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true);
        opts.recurse_untracked_dirs(false);
        opts.include_ignored(false);
        opts.exclude_submodules(true);

        let statuses = self.repo.statuses(Some(&mut opts))?;

        let mut counts = StatusCounts::default();
        for entry in statuses.iter() {
            match classify(entry.status()) {
                Some(EntryKind::Untracked) => counts.untracked += 1,
                Some(EntryKind::Uncommitted) => counts.uncommitted += 1,
                None => {}
            }
        }

        Ok(counts)
    }
}

enum EntryKind {
    Uncommitted,
    Untracked,
}

fn classify(status: Status) -> Option<EntryKind> {
    if status.is_empty() || status.contains(Status::IGNORED) {
        return None;
    }
    if status == Status::WT_NEW {
        return Some(EntryKind::Untracked);
    }
    Some(EntryKind::Uncommitted)
}
