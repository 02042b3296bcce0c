//! Git operations using git2-rs
//!
//! This is the version-control collaborator of the parallel engine. It provides
//! the four primitives the engine needs, organized into focused submodules:
//! - `manager` - Core GitManager struct and repository access
//! - `branches` - Branch operations (create from base, delete, ahead/behind)
//! - `worktrees` - Worktree management (add, remove, list, prune)
//! - `merge` - Merge, dry-run conflict checks and abort
//! - `status` - Working copy cleanliness
//! - `types` - Shared data structures

// Submodules
mod branches;
mod manager;
mod merge;
mod status;
mod types;
mod worktrees;

// Re-export the main GitManager struct
pub use manager::GitManager;

// Re-export all types for public use
pub use types::{BranchInfo, MergeResult, StatusCounts, WorktreeInfo};
