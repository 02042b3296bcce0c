// Durable instance snapshot and single-coordinator lock

use crate::error::{ParallelError, Result};
use crate::parallel::instance::TaskInstance;
use crate::utils::{atomic_write, ensure_dir, parallel_state_dir};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const SNAPSHOT_VERSION: u32 = 1;

/// On-disk form of the coordinator's registry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSnapshot {
    pub version: u32,
    pub run_id: String,
    pub saved_at: DateTime<Utc>,
    pub primary_branch: String,
    pub instances: Vec<TaskInstance>,
}

/// Reads and writes `.ralph-ui/parallel/instances.json`
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(project_path: &Path) -> Self {
        Self {
            path: parallel_state_dir(project_path).join("instances.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last saved snapshot, if any
    pub fn read(&self) -> Result<Option<InstanceSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&self.path)?;
        match serde_json::from_str::<InstanceSnapshot>(&content) {
            Ok(snapshot) if snapshot.version == SNAPSHOT_VERSION => Ok(Some(snapshot)),
            Ok(snapshot) => {
                log::warn!(
                    "[Recovery] Ignoring snapshot with unsupported version {}",
                    snapshot.version
                );
                Ok(None)
            }
            Err(e) => {
                log::warn!("[Recovery] Ignoring unreadable snapshot {:?}: {}", self.path, e);
                Ok(None)
            }
        }
    }

    /// Replace the snapshot atomically
    pub fn write(&self, run_id: &str, primary_branch: &str, instances: &[TaskInstance]) -> Result<()> {
        let snapshot = InstanceSnapshot {
            version: SNAPSHOT_VERSION,
            run_id: run_id.to_string(),
            saved_at: Utc::now(),
            primary_branch: primary_branch.to_string(),
            instances: instances.to_vec(),
        };
        let content = serde_json::to_string_pretty(&snapshot)?;
        atomic_write(&self.path, &content)?;
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// Lock file contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

/// Exclusive lock held for the lifetime of a coordinator, so two processes
/// never merge into the same primary workspace. Released on drop.
#[derive(Debug)]
pub struct CoordinatorLock {
    file: File,
    path: PathBuf,
}

impl CoordinatorLock {
    pub fn acquire(project_path: &Path) -> Result<Self> {
        let dir = parallel_state_dir(project_path);
        ensure_dir(&dir)?;
        let path = dir.join("coordinator.lock");

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        if file.try_lock_exclusive().is_err() {
            return Err(ParallelError::CoordinatorLocked(path));
        }

        let info = LockInfo {
            pid: std::process::id(),
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        file.set_len(0)?;
        if let Ok(json) = serde_json::to_string(&info) {
            file.write_all(json.as_bytes())?;
        }

        log::debug!("[Recovery] Acquired coordinator lock {:?}", path);
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CoordinatorLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            log::warn!("[Recovery] Failed to release lock {:?}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskDescriptor;
    use crate::parallel::instance::InstanceState;
    use crate::parallel::workspaces::Workspace;
    use tempfile::TempDir;

    fn instance(id: &str, state: InstanceState) -> TaskInstance {
        let workspace = Workspace {
            path: PathBuf::from(format!("/repo/.worktrees/{}", id)),
            branch_name: format!("task/{}", id),
            head_revision: None,
            is_primary: false,
        };
        let mut inst = TaskInstance::new(&TaskDescriptor::new(id, id, &[]), workspace);
        inst.state = state;
        inst
    }

    #[test]
    fn test_snapshot_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(temp_dir.path());
        assert!(store.read().unwrap().is_none());

        let instances = vec![
            instance("a", InstanceState::Running),
            instance("b", InstanceState::Conflicted),
        ];
        store.write("run-1", "main", &instances).unwrap();

        let snapshot = store.read().unwrap().unwrap();
        assert_eq!(snapshot.run_id, "run-1");
        assert_eq!(snapshot.primary_branch, "main");
        assert_eq!(snapshot.instances, instances);

        store.clear().unwrap();
        assert!(store.read().unwrap().is_none());
    }

    #[test]
    fn test_corrupt_snapshot_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(temp_dir.path());
        ensure_dir(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), "{ not json").unwrap();
        assert!(store.read().unwrap().is_none());
    }

    #[test]
    fn test_lock_is_exclusive() {
        let temp_dir = TempDir::new().unwrap();
        let lock = CoordinatorLock::acquire(temp_dir.path()).unwrap();
        assert!(lock.path().exists());

        assert!(matches!(
            CoordinatorLock::acquire(temp_dir.path()),
            Err(ParallelError::CoordinatorLocked(_))
        ));

        drop(lock);
        assert!(CoordinatorLock::acquire(temp_dir.path()).is_ok());
    }
}
