//! Backlog scheduler
//!
//! Drives a `ParallelCoordinator` over a backlog of tasks: each tick polls
//! workers, integrates completed work in the order it finished, cleans up
//! merged workspaces and admits as many pending tasks as admission allows.
//! Tasks blocked by a file overlap simply wait for the conflicting task to
//! finish, which serializes them.

use crate::error::ParallelError;
use crate::models::TaskDescriptor;
use crate::parallel::coordinator::ParallelCoordinator;
use crate::parallel::instance::InstanceState;
use crate::parallel::pool::REASON_MAX_CONCURRENT;
use crate::shutdown::{ShutdownHandler, ShutdownResult, ShutdownState};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConflictedTask {
    pub task_id: String,
    pub branch: String,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FailedTask {
    pub task_id: String,
    pub branch: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NotStartedTask {
    pub task_id: String,
    pub reason: String,
}

/// Outcome of one scheduler run
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    /// Merged task ids, in merge order
    pub merged: Vec<String>,
    pub conflicted: Vec<ConflictedTask>,
    pub failed: Vec<FailedTask>,
    pub not_started: Vec<NotStartedTask>,
    /// Set when the run was stopped by a shutdown request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown: Option<ShutdownResult>,
}

impl RunSummary {
    /// Every task was merged
    pub fn is_success(&self) -> bool {
        self.conflicted.is_empty()
            && self.failed.is_empty()
            && self.not_started.is_empty()
            && self.shutdown.is_none()
    }
}

/// Result of one admission pass
#[derive(Debug, Default)]
struct AdmissionRound {
    admitted: usize,
    /// Admission stopped on host load rather than the instance limit
    load_limited: bool,
    /// Last reason each waiting task was turned away
    blocked: HashMap<String, String>,
}

/// Runs a backlog to completion on one coordinator
pub struct ParallelScheduler {
    poll_interval: Duration,
    shutdown: ShutdownState,
}

impl ParallelScheduler {
    pub fn new(poll_interval: Duration, shutdown: ShutdownState) -> Self {
        Self {
            poll_interval,
            shutdown,
        }
    }

    /// Scheduler using the coordinator's configured poll interval
    pub fn for_coordinator(coordinator: &ParallelCoordinator, shutdown: ShutdownState) -> Self {
        Self::new(
            Duration::from_millis(coordinator.config().execution.poll_interval_ms),
            shutdown,
        )
    }

    pub async fn run(
        &self,
        coordinator: &mut ParallelCoordinator,
        backlog: Vec<TaskDescriptor>,
    ) -> RunSummary {
        let mut pending: VecDeque<TaskDescriptor> = backlog.into();
        let mut summary = RunSummary::default();
        // Completed tasks whose merge failed for a reason other than a conflict
        let mut merge_errors: HashMap<String, String> = HashMap::new();
        let mut cleanup_errors: HashSet<String> = HashSet::new();
        let auto_cleanup_failed = coordinator.config().execution.auto_cleanup_failed;

        log::info!(
            "[Scheduler] Starting run {} with {} task(s)",
            coordinator.run_id(),
            pending.len()
        );

        loop {
            if self.shutdown.is_shutdown_requested() {
                log::warn!("[Scheduler] Shutdown requested, stopping run");
                self.stop(coordinator, &mut pending, &mut summary).await;
                break;
            }

            coordinator.poll_all();

            // Integrate in the order completions were observed
            for task_id in coordinator.completed_in_order() {
                if merge_errors.contains_key(&task_id) {
                    continue;
                }
                match coordinator.integrate(&task_id) {
                    Ok(outcome) if outcome.success => summary.merged.push(task_id.clone()),
                    Ok(_) => {
                        log::warn!("[Scheduler] Task {} conflicted, branch preserved", task_id);
                    }
                    Err(e) => {
                        log::error!("[Scheduler] Merge of task {} failed: {}", task_id, e);
                        merge_errors.insert(task_id.clone(), format!("merge error: {}", e));
                    }
                }
            }

            // Includes instances recovered as Merged from a previous run
            for instance in coordinator.snapshot_instances() {
                if instance.state != InstanceState::Merged
                    || cleanup_errors.contains(&instance.task_id)
                {
                    continue;
                }
                if let Err(e) = coordinator.cleanup(&instance.task_id, false) {
                    log::warn!(
                        "[Scheduler] Cleanup of merged task {} failed: {}",
                        instance.task_id,
                        e
                    );
                    cleanup_errors.insert(instance.task_id.clone());
                }
            }

            if auto_cleanup_failed {
                for instance in coordinator.snapshot_instances() {
                    if instance.state != InstanceState::Failed {
                        continue;
                    }
                    let reason = instance
                        .failure_reason
                        .clone()
                        .unwrap_or_else(|| "worker failed".to_string());
                    let cleaned = coordinator
                        .acknowledge(&instance.task_id)
                        .and_then(|_| coordinator.cleanup(&instance.task_id, true));
                    match cleaned {
                        Ok(()) => summary.failed.push(FailedTask {
                            task_id: instance.task_id.clone(),
                            branch: instance.branch_name.clone(),
                            reason,
                        }),
                        Err(e) => log::warn!(
                            "[Scheduler] Could not clean up failed task {}: {}",
                            instance.task_id,
                            e
                        ),
                    }
                }
            }

            let admission = self.admit_pending(coordinator, &mut pending, &mut summary);

            let has_work = coordinator.snapshot_instances().iter().any(|i| match i.state {
                InstanceState::Spawning | InstanceState::Running | InstanceState::Merging => true,
                InstanceState::Completed => !merge_errors.contains_key(&i.task_id),
                _ => false,
            });

            if pending.is_empty() && !has_work {
                break;
            }

            if !has_work && admission.admitted == 0 && !admission.load_limited {
                // Slots or files are held by instances that will not finish
                log::warn!(
                    "[Scheduler] No progress possible, {} task(s) left unstarted",
                    pending.len()
                );
                for task in pending.drain(..) {
                    let reason = admission
                        .blocked
                        .get(&task.id)
                        .cloned()
                        .unwrap_or_else(|| "no progress possible".to_string());
                    summary.not_started.push(NotStartedTask {
                        task_id: task.id,
                        reason,
                    });
                }
                break;
            }

            tokio::time::sleep(self.poll_interval).await;
        }

        collect_preserved(coordinator, &merge_errors, &mut summary);

        log::info!(
            "[Scheduler] Run finished: {} merged, {} conflicted, {} failed, {} not started",
            summary.merged.len(),
            summary.conflicted.len(),
            summary.failed.len(),
            summary.not_started.len()
        );
        summary
    }

    /// Admit pending tasks in backlog order
    fn admit_pending(
        &self,
        coordinator: &mut ParallelCoordinator,
        pending: &mut VecDeque<TaskDescriptor>,
        summary: &mut RunSummary,
    ) -> AdmissionRound {
        let mut round = AdmissionRound::default();
        let mut waiting = VecDeque::new();

        while let Some(task) = pending.pop_front() {
            match coordinator.admit_and_spawn(&task) {
                Ok(_) => round.admitted += 1,
                Err(ParallelError::ResourceExhausted(reason)) => {
                    log::debug!("[Scheduler] Admission paused: {}", reason);
                    // Host load can drop on its own; a full slot table cannot
                    round.load_limited = reason != REASON_MAX_CONCURRENT;
                    round.blocked.insert(task.id.clone(), reason);
                    waiting.push_back(task);
                    break;
                }
                Err(e @ ParallelError::ConcurrencyBlocked { .. }) => {
                    log::info!("[Scheduler] Task {} queued: {}", task.id, e);
                    round.blocked.insert(task.id.clone(), e.to_string());
                    waiting.push_back(task);
                }
                Err(e) => {
                    log::error!("[Scheduler] Task {} not started: {}", task.id, e);
                    summary.not_started.push(NotStartedTask {
                        task_id: task.id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        waiting.append(pending);
        *pending = waiting;
        round
    }

    /// Stop every worker and preserve what finished
    async fn stop(
        &self,
        coordinator: &mut ParallelCoordinator,
        pending: &mut VecDeque<TaskDescriptor>,
        summary: &mut RunSummary,
    ) {
        for instance in coordinator.snapshot_instances() {
            let reason = match instance.state {
                InstanceState::Pending | InstanceState::Spawning | InstanceState::Running => {
                    "cancelled by shutdown"
                }
                InstanceState::Completed => "not merged before shutdown",
                _ => continue,
            };
            summary.failed.push(FailedTask {
                task_id: instance.task_id.clone(),
                branch: instance.branch_name.clone(),
                reason: reason.to_string(),
            });
        }

        for task in pending.drain(..) {
            summary.not_started.push(NotStartedTask {
                task_id: task.id,
                reason: "shutdown requested".to_string(),
            });
        }

        let handler = ShutdownHandler::with_state(self.shutdown.clone());
        let result = handler.handle_shutdown(|| coordinator.cancel_all()).await;
        summary.shutdown = Some(result);
    }
}

/// Record instances still held by the coordinator at the end of a run
fn collect_preserved(
    coordinator: &ParallelCoordinator,
    merge_errors: &HashMap<String, String>,
    summary: &mut RunSummary,
) {
    for instance in coordinator.snapshot_instances() {
        let already = summary.failed.iter().any(|f| f.task_id == instance.task_id);
        match instance.state {
            InstanceState::Conflicted => summary.conflicted.push(ConflictedTask {
                task_id: instance.task_id.clone(),
                branch: instance.branch_name.clone(),
                files: instance.conflicting_files.clone(),
            }),
            InstanceState::Failed if !already => summary.failed.push(FailedTask {
                task_id: instance.task_id.clone(),
                branch: instance.branch_name.clone(),
                reason: instance
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "worker failed".to_string()),
            }),
            InstanceState::Completed if !already => {
                if let Some(reason) = merge_errors.get(&instance.task_id) {
                    summary.failed.push(FailedTask {
                        task_id: instance.task_id.clone(),
                        branch: instance.branch_name.clone(),
                        reason: reason.clone(),
                    });
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_summary_is_success() {
        let summary = RunSummary {
            merged: vec!["a".to_string()],
            ..Default::default()
        };
        assert!(summary.is_success());
    }

    #[test]
    fn test_summary_with_conflict_is_not_success() {
        let summary = RunSummary {
            conflicted: vec![ConflictedTask {
                task_id: "b".to_string(),
                branch: "task/b".to_string(),
                files: vec!["shared.txt".to_string()],
            }],
            ..Default::default()
        };
        assert!(!summary.is_success());

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["conflicted"][0]["taskId"], "b");
        assert!(json.get("shutdown").is_none());
    }

    #[test]
    fn test_interrupted_run_is_not_success() {
        let summary = RunSummary {
            shutdown: Some(ShutdownResult::default()),
            ..Default::default()
        };
        assert!(!summary.is_success());
    }

    #[test]
    fn test_interrupted_summary_reloads_from_json() {
        let summary = RunSummary {
            merged: vec!["a".to_string()],
            shutdown: Some(ShutdownResult {
                workers_stopped: 1,
                workspaces_cleaned: 1,
                preserved_branches: vec!["task/b".to_string()],
                errors: vec![],
            }),
            ..Default::default()
        };

        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("\"preservedBranches\":[\"task/b\"]"));

        let reloaded: RunSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(reloaded, summary);
    }
}
