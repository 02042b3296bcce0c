//! Parallel task execution
//!
//! Runs several tasks at once, each in its own git worktree on its own
//! branch, and integrates finished branches back into the primary branch:
//! - `workspaces` - Workspace Manager (worktree + branch per task)
//! - `conflicts` - Task Separation Analyzer (file-impact overlap scoring)
//! - `pool` - Resource Admission Controller (concurrency + host load)
//! - `worker` - Worker process launch and supervision
//! - `instance` - Task instance records and state machine
//! - `merge_coordinator` - Merge Coordinator (dry run, merge, abort)
//! - `coordinator` - Parallel Execution Coordinator
//! - `scheduler` - Backlog-driven run loop on top of the coordinator
//! - `recovery` - Instance snapshot and coordinator lock

pub mod conflicts;
pub mod coordinator;
pub mod instance;
pub mod merge_coordinator;
pub mod pool;
pub mod recovery;
pub mod scheduler;
pub mod worker;
pub mod workspaces;

pub use conflicts::{
    FileOverlapStrategy, PairOverlap, Recommendation, SeparationReport, SeparationStrategy,
    TaskSeparationAnalyzer,
};
pub use coordinator::{ParallelCoordinator, StatusReport};
pub use instance::{InstanceState, TaskInstance};
pub use merge_coordinator::{ConflictInfo, MergeCoordinator, MergeOutcome};
pub use pool::{
    AdmissionDecision, FixedSampler, HostLoad, ResourceAdmissionController, ResourceSampler,
    ResourceSnapshot, SystemSampler,
};
pub use scheduler::{ParallelScheduler, RunSummary};
pub use workspaces::{Workspace, WorkspaceManager, WorkspaceStatus};
