//! Worker process supervision
//!
//! Every worker is a child process owned by one supervising tokio task. The
//! supervisor waits for the child and reports a `WorkerExit` over a channel,
//! so the coordinator only ever reads exits that already happened.

use crate::config::WorkerConfig;
use crate::error::{ParallelError, Result};
use crate::parallel::instance::TaskInstance;
use crate::utils::{ensure_dir, sanitize_path_component};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// How a worker process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub task_id: String,
    /// Identifies the launch that produced this exit
    pub launch_id: u64,
    /// `None` when the process was killed by a signal or never waited on
    pub exit_code: Option<i32>,
    /// Set when the process could not be waited on or was cancelled
    pub error: Option<String>,
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        self.error.is_none() && self.exit_code == Some(0)
    }
}

/// Coordinator-side handle to a supervised worker
#[derive(Debug)]
pub struct WorkerHandle {
    pub pid: Option<u32>,
    /// Unique per launch; a relaunched task gets a new id
    pub launch_id: u64,
    pub started_at: DateTime<Utc>,
    kill: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Whether the supervisor is still waiting on the child
    pub fn is_alive(&self) -> bool {
        self.join.as_ref().map(|j| !j.is_finished()).unwrap_or(false)
    }

    /// Kill the worker and wait (bounded) for its supervisor to finish.
    /// Returns false if the supervisor had to be aborted.
    pub async fn terminate(&mut self, timeout: Duration) -> bool {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }

        let Some(join) = self.join.take() else {
            return true;
        };

        let abort = join.abort_handle();
        match tokio::time::timeout(timeout, join).await {
            Ok(_) => true,
            Err(_) => {
                log::warn!(
                    "[Worker] Supervisor for pid {:?} did not stop within {:?}, aborting",
                    self.pid,
                    timeout
                );
                abort.abort();
                false
            }
        }
    }
}

/// Starts worker processes bound to task workspaces
pub struct WorkerLauncher {
    config: WorkerConfig,
    log_dir: Option<PathBuf>,
    exit_tx: mpsc::UnboundedSender<WorkerExit>,
    next_launch: AtomicU64,
}

impl WorkerLauncher {
    /// `log_dir` receives one `<task>.log` per worker (stdout and stderr);
    /// `None` discards worker output.
    pub fn new(
        config: WorkerConfig,
        log_dir: Option<PathBuf>,
        exit_tx: mpsc::UnboundedSender<WorkerExit>,
    ) -> Self {
        Self {
            config,
            log_dir,
            exit_tx,
            next_launch: AtomicU64::new(1),
        }
    }

    /// Resolve the worker command on PATH
    pub fn validate(&self) -> Result<PathBuf> {
        if self.config.command.trim().is_empty() {
            return Err(ParallelError::Config("worker.command is required".to_string()));
        }
        which::which(&self.config.command).map_err(|e| {
            ParallelError::Config(format!(
                "worker command '{}' not found: {}",
                self.config.command, e
            ))
        })
    }

    /// Arguments for one instance with placeholders substituted
    pub fn render_args(&self, instance: &TaskInstance) -> Vec<String> {
        let workspace = instance.workspace.path.to_string_lossy();
        self.config
            .args
            .iter()
            .map(|arg| {
                arg.replace("{task_id}", &instance.task_id)
                    .replace("{label}", &instance.label)
                    .replace("{branch}", &instance.branch_name)
                    .replace("{workspace}", &workspace)
            })
            .collect()
    }

    /// Spawn the worker for `instance` inside its workspace.
    /// Must be called from within a tokio runtime.
    pub fn launch(&self, instance: &TaskInstance) -> Result<WorkerHandle> {
        let spawn_error = |reason: String| ParallelError::Spawn {
            task_id: instance.task_id.clone(),
            reason,
        };

        let mut cmd = Command::new(&self.config.command);
        cmd.args(self.render_args(instance))
            .current_dir(&instance.workspace.path)
            .stdin(Stdio::null())
            .env("RALPH_TASK_ID", &instance.task_id)
            .env("RALPH_TASK_LABEL", &instance.label)
            .env("RALPH_BRANCH", &instance.branch_name)
            .env("RALPH_WORKSPACE", &instance.workspace.path)
            .env("RALPH_FILE_HINTS", instance.file_impact_hints.join(","))
            .envs(&self.config.env)
            .kill_on_drop(true);

        match &self.log_dir {
            Some(dir) => {
                ensure_dir(dir).map_err(|e| spawn_error(format!("log directory: {}", e)))?;
                let log_path = dir.join(format!("{}.log", sanitize_path_component(&instance.task_id)));
                let stdout = std::fs::File::create(&log_path)
                    .map_err(|e| spawn_error(format!("log file {:?}: {}", log_path, e)))?;
                let stderr = stdout
                    .try_clone()
                    .map_err(|e| spawn_error(format!("log file {:?}: {}", log_path, e)))?;
                cmd.stdout(Stdio::from(stdout)).stderr(Stdio::from(stderr));
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let child = cmd.spawn().map_err(|e| {
            spawn_error(format!("failed to start '{}': {}", self.config.command, e))
        })?;
        let pid = child.id();
        let launch_id = self.next_launch.fetch_add(1, Ordering::Relaxed);

        let (kill_tx, kill_rx) = oneshot::channel();
        let join = tokio::spawn(supervise(
            instance.task_id.clone(),
            launch_id,
            child,
            kill_rx,
            self.exit_tx.clone(),
        ));

        log::info!(
            "[Worker] Started '{}' for task {} (pid {:?}) in {:?}",
            self.config.command,
            instance.task_id,
            pid,
            instance.workspace.path
        );

        Ok(WorkerHandle {
            pid,
            launch_id,
            started_at: Utc::now(),
            kill: Some(kill_tx),
            join: Some(join),
        })
    }
}

/// Own the child until it exits or a kill is requested, then report once
async fn supervise(
    task_id: String,
    launch_id: u64,
    mut child: tokio::process::Child,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: mpsc::UnboundedSender<WorkerExit>,
) {
    // A dropped handle is treated like an explicit kill
    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill_rx => None,
    };

    let exit = match waited {
        Some(Ok(status)) => WorkerExit {
            task_id,
            launch_id,
            exit_code: status.code(),
            error: if status.code().is_none() {
                Some("terminated by signal".to_string())
            } else {
                None
            },
        },
        Some(Err(e)) => WorkerExit {
            task_id,
            launch_id,
            exit_code: None,
            error: Some(format!("failed to wait for worker: {}", e)),
        },
        None => {
            if let Err(e) = child.kill().await {
                log::warn!("[Worker] Failed to kill worker for task {}: {}", task_id, e);
            }
            WorkerExit {
                task_id,
                launch_id,
                exit_code: None,
                error: Some("cancelled".to_string()),
            }
        }
    };

    log::debug!(
        "[Worker] Task {} exited with {:?} ({:?})",
        exit.task_id,
        exit.exit_code,
        exit.error
    );
    let _ = exit_tx.send(exit);
}
