// Shared fixtures for the parallel engine integration tests
#![allow(dead_code)]

use git2::{Repository, RepositoryInitOptions, Signature};
use ralph_parallel_lib::config::{ParallelConfig, WorkerConfig};
use ralph_parallel_lib::parallel::{FixedSampler, InstanceState};
use ralph_parallel_lib::ParallelCoordinator;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

pub const PRIMARY: &str = "main";

/// Throw-away repository with one commit on `main`
pub struct TestProject {
    pub dir: TempDir,
    /// Gates for the gated worker, one file per task
    pub gates: TempDir,
}

impl TestProject {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head(PRIMARY);
        let repo = Repository::init_opts(dir.path(), &opts).unwrap();

        fs::write(dir.path().join(".gitignore"), ".worktrees/\n.ralph-ui/\n").unwrap();
        fs::write(dir.path().join("README.md"), "# fixture\n").unwrap();
        fs::write(dir.path().join("shared.txt"), "base\n").unwrap();
        commit_all(&repo, "Initial commit");

        Self {
            dir,
            gates: TempDir::new().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Config running the gated worker with fast polling
    pub fn config(&self, max_concurrent: usize) -> ParallelConfig {
        let mut config = ParallelConfig::default();
        config.execution.max_concurrent = max_concurrent;
        config.execution.poll_interval_ms = 20;
        config.git.primary_branch = Some(PRIMARY.to_string());
        config.worker = gated_worker(self.gates.path());
        config
    }

    pub fn coordinator(&self, max_concurrent: usize) -> ParallelCoordinator {
        ParallelCoordinator::with_sampler(
            self.path(),
            self.config(max_concurrent),
            Box::new(FixedSampler::idle()),
        )
        .unwrap()
    }

    /// Let the gated worker for `task_id` exit with code 0
    pub fn release(&self, task_id: &str) {
        fs::write(self.gates.path().join(format!("{}.go", task_id)), "").unwrap();
    }

    /// Let the gated worker for `task_id` exit with code 3
    pub fn fail(&self, task_id: &str) {
        fs::write(self.gates.path().join(format!("{}.fail", task_id)), "").unwrap();
    }

    pub fn primary_tip(&self) -> git2::Oid {
        let repo = Repository::open(self.path()).unwrap();
        let tip = repo.head().unwrap().peel_to_commit().unwrap().id();
        tip
    }

    pub fn branch_exists(&self, name: &str) -> bool {
        let repo = Repository::open(self.path()).unwrap();
        let exists = repo.find_branch(name, git2::BranchType::Local).is_ok();
        exists
    }
}

/// `sh` worker that waits for a gate file named after its task
pub fn gated_worker(gates: &Path) -> WorkerConfig {
    let script = format!(
        "d='{}'; while :; do \
         if [ -f \"$d/$RALPH_TASK_ID.go\" ]; then exit 0; fi; \
         if [ -f \"$d/$RALPH_TASK_ID.fail\" ]; then exit 3; fi; \
         sleep 0.02; done",
        gates.display()
    );
    WorkerConfig {
        command: "sh".to_string(),
        args: vec!["-c".to_string(), script],
        ..Default::default()
    }
}

/// Stage everything in the working copy and commit on HEAD
pub fn commit_all(repo: &Repository, message: &str) -> git2::Oid {
    let sig = Signature::now("Test User", "test@example.com").unwrap();
    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
        .unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();

    let parents = match repo.head() {
        Ok(head) => vec![head.peel_to_commit().unwrap()],
        Err(_) => vec![],
    };
    let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
    let oid = repo
        .commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)
        .unwrap();
    oid
}

/// Write `content` to `file` inside `workdir` and commit it there
pub fn commit_file(workdir: &Path, file: &str, content: &str) -> git2::Oid {
    let path = workdir.join(file);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, content).unwrap();
    let repo = Repository::open(workdir).unwrap();
    commit_all(&repo, &format!("Update {}", file))
}

/// Poll until `task_id` reaches `state`, or panic after a few seconds
pub async fn wait_for_state(coordinator: &mut ParallelCoordinator, task_id: &str, state: InstanceState) {
    for _ in 0..500 {
        coordinator.poll_all();
        if coordinator.instance(task_id).map(|i| i.state) == Some(state) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "task {} never reached {:?}, last seen {:?}",
        task_id,
        state,
        coordinator.instance(task_id).map(|i| i.state)
    );
}

pub fn workspace_path(coordinator: &ParallelCoordinator, task_id: &str) -> PathBuf {
    coordinator.instance(task_id).unwrap().workspace.path
}
