// Clippy allows for reasonable defaults
// These suppress warnings where the suggested change doesn't improve readability
#![allow(clippy::new_without_default)] // Default not always appropriate for stateful types
#![allow(clippy::derivable_impls)] // Explicit Default impls can be clearer
#![allow(clippy::field_reassign_with_default)] // Builder pattern is clearer
#![allow(clippy::collapsible_if)] // Separate ifs can be more readable

// Module declarations
pub mod config;
pub mod error;
pub mod events;
pub mod git;
pub mod models;
pub mod parallel;
pub mod shutdown;
mod utils;

pub use error::{ParallelError, Result};
pub use models::TaskDescriptor;
pub use parallel::coordinator::ParallelCoordinator;
pub use parallel::scheduler::{ParallelScheduler, RunSummary};
