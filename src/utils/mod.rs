// Utility functions

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

// =============================================================================
// Path Helpers
// =============================================================================

/// Get the .ralph-ui directory path for a project.
#[inline]
pub fn ralph_ui_dir(project_path: &Path) -> PathBuf {
    project_path.join(".ralph-ui")
}

/// Get the .ralph-ui/parallel directory (snapshot and lock files).
#[inline]
pub fn parallel_state_dir(project_path: &Path) -> PathBuf {
    ralph_ui_dir(project_path).join("parallel")
}

/// Get the .ralph-ui/parallel.yaml config path for a project.
#[inline]
pub fn config_path(project_path: &Path) -> PathBuf {
    ralph_ui_dir(project_path).join("parallel.yaml")
}

/// Sanitize a string for use as one component of a branch name.
///
/// Keeps alphanumerics, `-`, `_` and `.`; everything else becomes `-`.
/// Leading dots are dropped because git rejects `.`-prefixed ref components.
pub fn sanitize_branch_component(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').replace("..", "-");
    cleaned.trim_end_matches(".lock").to_string()
}

/// Sanitize a string for use as a single path component
pub fn sanitize_path_component(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// =============================================================================
// File Helpers
// =============================================================================

/// Create a directory (and parents) if it does not exist
pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Write a file atomically: write to a temp file, then rename over the target
pub fn atomic_write(path: &Path, content: &str) -> std::io::Result<()> {
    let temp_path = path.with_extension("tmp");

    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }

    fs::write(&temp_path, content)?;
    fs::rename(&temp_path, path)?;

    Ok(())
}

// =============================================================================
// Lock Helpers
// =============================================================================

/// Safely acquire a mutex lock, recovering from poisoning by returning the guard.
/// The guarded state may be inconsistent after a panic elsewhere, so this is only
/// used for state that is rebuilt on every access (system samplers, counters).
pub fn lock_mutex_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::warn!("Mutex was poisoned, recovering: {}", poisoned);
            poisoned.into_inner()
        }
    }
}
