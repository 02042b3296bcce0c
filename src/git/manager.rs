//! Core GitManager implementation
//!
//! Contains the GitManager struct and its basic operations

use git2::{Error as GitError, Repository, RepositoryState};
use std::path::{Path, PathBuf};

/// Git manager for repository operations
///
/// Opened per operation rather than held long-term: `git2::Repository` is not
/// `Sync`, and each worktree is its own repository handle.
pub struct GitManager {
    pub(crate) repo: Repository,
}

impl GitManager {
    /// Create a new GitManager for the given repository or worktree path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, GitError> {
        let repo = Repository::open(path)?;
        Ok(Self { repo })
    }

    /// Get the path of the repository's git directory
    pub fn repo_path(&self) -> PathBuf {
        self.repo.path().to_path_buf()
    }

    /// Get the working directory of this repository
    pub fn workdir(&self) -> Result<PathBuf, GitError> {
        self.repo
            .workdir()
            .map(|p| p.to_path_buf())
            .ok_or_else(|| GitError::from_str("Repository has no working directory"))
    }

    /// Whether an operation such as a merge is half-way done
    pub fn has_pending_operation(&self) -> bool {
        self.repo.state() != RepositoryState::Clean
    }
}
