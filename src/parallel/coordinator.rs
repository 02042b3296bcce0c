//! Parallel Execution Coordinator
//!
//! Owns the registry of task instances and drives each one through
//! `Pending -> Spawning -> Running -> {Completed|Failed} -> Merging ->
//! {Merged|Conflicted} -> CleanedUp`. It is the only writer of that registry;
//! everything else receives copies.

use crate::config::ParallelConfig;
use crate::error::{ParallelError, Result};
use crate::events::{
    timestamp, AdmissionDeniedPayload, CleanupFailedPayload, EventEmitter,
    InstanceCleanedUpPayload, InstanceCompletedPayload, InstanceFailedPayload,
    InstanceSpawnedPayload, InstanceStalledPayload, MergeConflictedPayload,
    MergeSucceededPayload, ParallelEvent, SeparationBlockedPayload,
};
use crate::git::GitManager;
use crate::models::TaskDescriptor;
use crate::parallel::conflicts::{Recommendation, SeparationStrategy, TaskSeparationAnalyzer};
use crate::parallel::instance::{is_in_flight, is_preserved, InstanceState, TaskInstance};
use crate::parallel::merge_coordinator::{MergeCoordinator, MergeOutcome};
use crate::parallel::pool::{ResourceAdmissionController, ResourceSampler, SystemSampler};
use crate::parallel::recovery::{CoordinatorLock, SnapshotStore};
use crate::parallel::worker::{WorkerExit, WorkerHandle, WorkerLauncher};
use crate::parallel::workspaces::{WorkspaceManager, WorkspaceStatus};
use crate::shutdown::ShutdownResult;
use crate::utils::parallel_state_dir;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;

/// How long a cancelled worker gets to exit before its supervisor is aborted
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Point-in-time view of one instance, produced by `poll_all`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub task_id: String,
    pub branch_name: String,
    pub state: InstanceState,
    /// State before this poll
    pub previous_state: InstanceState,
    pub exit_code: Option<i32>,
    pub worker_alive: bool,
    pub running_secs: u64,
    pub stalled: bool,
    pub flagged: bool,
    /// Workspace status, when inspected during this poll
    pub workspace: Option<WorkspaceStatus>,
}

impl StatusReport {
    pub fn changed(&self) -> bool {
        self.state != self.previous_state
    }
}

/// Orchestrates separation analysis, admission, workspaces, workers and merges
pub struct ParallelCoordinator {
    config: ParallelConfig,
    run_id: String,
    workspaces: WorkspaceManager,
    analyzer: TaskSeparationAnalyzer,
    admission: ResourceAdmissionController,
    launcher: WorkerLauncher,
    exits: mpsc::UnboundedReceiver<WorkerExit>,
    merger: MergeCoordinator,
    /// Active instances in admission order
    instances: Vec<TaskInstance>,
    handles: HashMap<String, WorkerHandle>,
    /// Completed instances in the order their exits were observed
    completion_order: VecDeque<String>,
    cleaned: HashSet<String>,
    emitter: EventEmitter,
    snapshots: SnapshotStore,
    _lock: CoordinatorLock,
}

impl ParallelCoordinator {
    /// Coordinator sampling live host load
    pub fn new(project_path: &Path, config: ParallelConfig) -> Result<Self> {
        Self::with_sampler(project_path, config, Box::new(SystemSampler::new()))
    }

    pub fn with_sampler(
        project_path: &Path,
        config: ParallelConfig,
        sampler: Box<dyn ResourceSampler>,
    ) -> Result<Self> {
        config.validate(true)?;

        let workspaces = WorkspaceManager::new(project_path, &config)?;
        let project_path = workspaces.project_path().to_path_buf();
        let lock = CoordinatorLock::acquire(&project_path)?;

        let (exit_tx, exits) = mpsc::unbounded_channel();
        let launcher = WorkerLauncher::new(
            config.worker.clone(),
            Some(parallel_state_dir(&project_path).join("logs")),
            exit_tx,
        );
        let worker_path = launcher.validate()?;

        let run_id = uuid::Uuid::new_v4().to_string();
        log::info!(
            "[Coordinator] Run {} on {:?}: primary branch {}, max {} instance(s), worker {:?}",
            run_id,
            project_path,
            workspaces.primary_branch(),
            config.execution.max_concurrent,
            worker_path
        );

        Ok(Self {
            analyzer: TaskSeparationAnalyzer::new(config.separation.clone()),
            admission: ResourceAdmissionController::with_sampler(&config, sampler),
            merger: MergeCoordinator::new(&project_path, workspaces.primary_branch()),
            snapshots: SnapshotStore::new(&project_path),
            config,
            run_id,
            workspaces,
            launcher,
            exits,
            instances: Vec::new(),
            handles: HashMap::new(),
            completion_order: VecDeque::new(),
            cleaned: HashSet::new(),
            emitter: EventEmitter::disabled(),
            _lock: lock,
        })
    }

    /// Forward structured events to `emitter`
    pub fn with_events(mut self, emitter: EventEmitter) -> Self {
        self.emitter = emitter;
        self
    }

    /// Replace the separation heuristic
    pub fn with_strategy(mut self, strategy: Box<dyn SeparationStrategy>) -> Self {
        self.analyzer = TaskSeparationAnalyzer::with_strategy(strategy);
        log::info!(
            "[Coordinator] Using separation strategy {}",
            self.analyzer.strategy_name()
        );
        self
    }

    pub fn config(&self) -> &ParallelConfig {
        &self.config
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    pub fn primary_branch(&self) -> &str {
        self.workspaces.primary_branch()
    }

    /// Instances not yet cleaned up. This is the count admission is bounded by.
    pub fn active_count(&self) -> usize {
        self.instances.len()
    }

    /// Copies of every active instance, in admission order
    pub fn snapshot_instances(&self) -> Vec<TaskInstance> {
        self.instances.clone()
    }

    pub fn instance(&self, task_id: &str) -> Option<TaskInstance> {
        self.find(task_id).cloned()
    }

    /// Completed instances waiting for integration, oldest observation first
    pub fn completed_in_order(&self) -> Vec<String> {
        self.completion_order.iter().cloned().collect()
    }

    /// Whether the instance can still produce or integrate work
    pub fn has_in_flight(&self) -> bool {
        self.instances.iter().any(|i| is_in_flight(i.state))
    }

    /// Admit one task: separation check, admission check, workspace, worker.
    /// Any partially created workspace is torn down before an error returns.
    pub fn admit_and_spawn(&mut self, task: &TaskDescriptor) -> Result<TaskInstance> {
        if self.find(&task.id).is_some() {
            return Err(ParallelError::Spawn {
                task_id: task.id.clone(),
                reason: "task already has an active instance".to_string(),
            });
        }

        let flagged = self.check_separation(task)?;

        let decision = self.admission.can_admit(self.active_count());
        if !decision.allowed {
            self.emitter.emit(ParallelEvent::AdmissionDenied(AdmissionDeniedPayload {
                task_id: task.id.clone(),
                reason: decision.reason.clone(),
                cpu_percent: decision.snapshot.cpu_percent,
                memory_percent: decision.snapshot.memory_percent,
                active_instance_count: decision.snapshot.active_instance_count,
                timestamp: timestamp(),
            }));
            return Err(ParallelError::ResourceExhausted(decision.reason));
        }

        let branch = self.workspaces.branch_name_for(&task.id);
        if branch == self.primary_branch() || self.instances.iter().any(|i| i.branch_name == branch) {
            return Err(ParallelError::Spawn {
                task_id: task.id.clone(),
                reason: format!("branch '{}' is already in use", branch),
            });
        }

        let primary = self.primary_branch().to_string();
        let workspace = self.workspaces.create_workspace(&task.id, &branch, &primary)?;

        let mut instance = TaskInstance::new(task, workspace);
        instance.flagged = flagged.is_some();
        instance.transition(InstanceState::Spawning)?;

        let handle = match self.launcher.launch(&instance) {
            Ok(handle) => handle,
            Err(e) => {
                self.teardown_failed_spawn(&instance);
                return Err(e);
            }
        };

        let Some(pid) = handle.pid else {
            // Dropping the handle kills the child
            drop(handle);
            self.teardown_failed_spawn(&instance);
            return Err(ParallelError::Spawn {
                task_id: task.id.clone(),
                reason: "worker reported no process id".to_string(),
            });
        };

        instance.pid = Some(pid);
        instance.started_at = handle.started_at;
        instance.transition(InstanceState::Running)?;

        self.emitter.emit(ParallelEvent::InstanceSpawned(InstanceSpawnedPayload {
            task_id: instance.task_id.clone(),
            branch: instance.branch_name.clone(),
            workspace_path: instance.workspace.path.to_string_lossy().to_string(),
            pid: instance.pid,
            recommendation: flagged.map(|r| r.to_string()),
            timestamp: timestamp(),
        }));

        self.cleaned.remove(&instance.task_id);
        self.handles.insert(instance.task_id.clone(), handle);
        self.instances.push(instance.clone());
        self.persist();

        Ok(instance)
    }

    /// Run separation analysis against in-flight instances.
    /// Returns the recommendation to flag, if any overlap was found.
    fn check_separation(&self, task: &TaskDescriptor) -> Result<Option<Recommendation>> {
        self.analyzer.validate(task)?;

        let mut candidates: Vec<TaskDescriptor> = self
            .instances
            .iter()
            .filter(|i| is_in_flight(i.state))
            .map(|i| i.descriptor())
            .collect();
        if candidates.is_empty() {
            return Ok(None);
        }
        candidates.push(task.clone());

        let report = self.analyzer.analyze(&candidates)?;

        let partners = report.unsafe_partners(&task.id);
        if !partners.is_empty() {
            let conflicts_with: Vec<String> = partners.iter().map(|(id, _)| id.to_string()).collect();
            let mut shared_files: Vec<String> = partners
                .iter()
                .flat_map(|(_, files)| files.iter().cloned())
                .collect();
            shared_files.sort();
            shared_files.dedup();

            log::info!(
                "[Coordinator] Task {} blocked by {:?} (shared: {:?})",
                task.id,
                conflicts_with,
                shared_files
            );
            self.emitter.emit(ParallelEvent::SeparationBlocked(SeparationBlockedPayload {
                task_id: task.id.clone(),
                conflicts_with: conflicts_with.clone(),
                shared_files: shared_files.clone(),
                confidence_score: report.confidence_score(),
                timestamp: timestamp(),
            }));
            return Err(ParallelError::ConcurrencyBlocked {
                task_id: task.id.clone(),
                conflicts_with,
                shared_files,
            });
        }

        let touches_task = report
            .overlaps()
            .iter()
            .any(|o| o.other(&task.id).is_some());
        if touches_task {
            log::warn!(
                "[Coordinator] Task {} admitted with caution (shared: {:?})",
                task.id,
                report.shared_files()
            );
            return Ok(Some(Recommendation::Caution));
        }
        Ok(None)
    }

    fn teardown_failed_spawn(&self, instance: &TaskInstance) {
        if let Err(e) = self.workspaces.remove_workspace(&instance.workspace, true) {
            log::error!(
                "[Coordinator] Failed to tear down workspace for task {}: {}",
                instance.task_id,
                e
            );
        }
    }

    /// Apply every worker exit observed so far and report on all instances.
    /// Only reads state that already exists; never waits on a worker.
    pub fn poll_all(&mut self) -> Vec<StatusReport> {
        let mut previous: HashMap<String, InstanceState> = self
            .instances
            .iter()
            .map(|i| (i.task_id.clone(), i.state))
            .collect();
        let mut inspected: HashMap<String, WorkspaceStatus> = HashMap::new();
        let mut changed = false;

        while let Ok(exit) = self.exits.try_recv() {
            let task_id = exit.task_id.clone();
            if let Some(status) = self.apply_exit(exit) {
                inspected.insert(task_id, status);
            }
            changed = true;
        }

        let max_running = self.config.execution.max_running_secs;
        for instance in self.instances.iter_mut() {
            if instance.state == InstanceState::Running
                && !instance.stalled
                && instance.running_secs() > max_running
            {
                instance.stalled = true;
                changed = true;
                log::warn!(
                    "[Coordinator] Task {} has been running for {}s, flagged as stalled",
                    instance.task_id,
                    instance.running_secs()
                );
                self.emitter.emit(ParallelEvent::InstanceStalled(InstanceStalledPayload {
                    task_id: instance.task_id.clone(),
                    branch: instance.branch_name.clone(),
                    running_secs: instance.running_secs(),
                    timestamp: timestamp(),
                }));
            }
        }

        if changed {
            self.persist();
        }

        self.instances
            .iter()
            .map(|i| StatusReport {
                task_id: i.task_id.clone(),
                branch_name: i.branch_name.clone(),
                state: i.state,
                previous_state: previous.remove(&i.task_id).unwrap_or(i.state),
                exit_code: i.exit_code,
                worker_alive: self
                    .handles
                    .get(&i.task_id)
                    .map(|h| h.is_alive())
                    .unwrap_or(false),
                running_secs: i.running_secs(),
                stalled: i.stalled,
                flagged: i.flagged,
                workspace: inspected.remove(&i.task_id),
            })
            .collect()
    }

    /// Infer Completed or Failed from one worker exit
    fn apply_exit(&mut self, exit: WorkerExit) -> Option<WorkspaceStatus> {
        // Exits of a cancelled earlier launch of the same task are stale
        match self.handles.get(&exit.task_id) {
            Some(handle) if handle.launch_id == exit.launch_id => {
                self.handles.remove(&exit.task_id);
            }
            _ => {
                log::debug!(
                    "[Coordinator] Ignoring stale exit of task {} (launch {})",
                    exit.task_id,
                    exit.launch_id
                );
                return None;
            }
        }

        let workspaces = &self.workspaces;
        let Some(instance) = self.instances.iter_mut().find(|i| i.task_id == exit.task_id) else {
            log::debug!("[Coordinator] Ignoring exit of untracked task {}", exit.task_id);
            return None;
        };
        if instance.state != InstanceState::Running {
            log::debug!(
                "[Coordinator] Ignoring exit of task {} in state {}",
                exit.task_id,
                instance.state
            );
            return None;
        }

        instance.exit_code = exit.exit_code;
        let status = workspaces.get_status(&instance.workspace);

        let failure = match (&exit, &status) {
            (exit, _) if exit.error.is_some() => exit.error.clone(),
            (exit, _) if !exit.success() => Some(
                ParallelError::ProcessCrash {
                    task_id: exit.task_id.clone(),
                    exit_code: exit.exit_code.unwrap_or(-1),
                }
                .to_string(),
            ),
            (_, Err(e)) => Some(format!("could not inspect workspace: {}", e)),
            (_, Ok(ws)) if !ws.is_clean => Some(format!(
                "workspace left with {} uncommitted and {} untracked change(s)",
                ws.uncommitted_count, ws.untracked_count
            )),
            _ => None,
        };

        let next = if failure.is_some() {
            InstanceState::Failed
        } else {
            InstanceState::Completed
        };
        if let Err(e) = instance.transition(next) {
            log::error!("[Coordinator] {}", e);
            return status.ok();
        }

        match failure {
            None => {
                self.completion_order.push_back(instance.task_id.clone());
                self.emitter.emit(ParallelEvent::InstanceCompleted(InstanceCompletedPayload {
                    task_id: instance.task_id.clone(),
                    branch: instance.branch_name.clone(),
                    timestamp: timestamp(),
                }));
            }
            Some(reason) => {
                log::warn!("[Coordinator] Task {} failed: {}", instance.task_id, reason);
                instance.failure_reason = Some(reason.clone());
                self.emitter.emit(ParallelEvent::InstanceFailed(InstanceFailedPayload {
                    task_id: instance.task_id.clone(),
                    branch: instance.branch_name.clone(),
                    exit_code: instance.exit_code,
                    reason,
                    timestamp: timestamp(),
                }));
            }
        }

        status.ok()
    }

    /// Merge a Completed instance into the primary branch.
    /// A conflict is returned as `Ok` with `success == false`.
    pub fn integrate(&mut self, task_id: &str) -> Result<MergeOutcome> {
        let branch = {
            let instance = self.find_mut(task_id)?;
            instance.transition(InstanceState::Merging)?;
            instance.branch_name.clone()
        };
        self.completion_order.retain(|id| id != task_id);
        self.persist();

        let result = self.merger.merge(task_id, &branch);
        let target = self.merger.target_branch().to_string();
        let instance = self.find_mut(task_id)?;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                instance.transition(InstanceState::Completed)?;
                self.completion_order.push_front(task_id.to_string());
                self.persist();
                return Err(e);
            }
        };

        let event = if outcome.success {
            instance.transition(InstanceState::Merged)?;
            ParallelEvent::MergeSucceeded(MergeSucceededPayload {
                task_id: task_id.to_string(),
                source_branch: branch,
                target_branch: target,
                commit_id: outcome.commit_id.clone(),
                fast_forward: outcome.fast_forward,
                timestamp: timestamp(),
            })
        } else {
            instance.transition(InstanceState::Conflicted)?;
            instance.conflicting_files = outcome.conflicting_files.clone();
            ParallelEvent::MergeConflicted(MergeConflictedPayload {
                task_id: task_id.to_string(),
                source_branch: branch,
                target_branch: target,
                conflicting_files: outcome.conflicting_files.clone(),
                workspace_path: instance.workspace.path.to_string_lossy().to_string(),
                timestamp: timestamp(),
            })
        };

        self.emitter.emit(event);
        self.persist();
        Ok(outcome)
    }

    /// Dry-run merge check for an instance's branch
    pub fn check_can_merge(&self, task_id: &str) -> Result<Vec<String>> {
        let instance = self
            .find(task_id)
            .ok_or_else(|| ParallelError::UnknownInstance(task_id.to_string()))?;
        self.merger.check_can_merge(&instance.branch_name)
    }

    /// Mark a Failed or Conflicted instance as seen by an operator
    pub fn acknowledge(&mut self, task_id: &str) -> Result<()> {
        let instance = self.find_mut(task_id)?;
        if !matches!(instance.state, InstanceState::Failed | InstanceState::Conflicted) {
            return Err(ParallelError::InvalidTransition {
                task_id: task_id.to_string(),
                from: instance.state,
                to: InstanceState::CleanedUp,
            });
        }
        instance.acknowledged = true;
        log::info!("[Coordinator] Task {} acknowledged", task_id);
        self.persist();
        Ok(())
    }

    /// Remove the workspace and branch of a Merged (or acknowledged
    /// Failed/Conflicted) instance. Cleaning an instance twice is a no-op.
    pub fn cleanup(&mut self, task_id: &str, force: bool) -> Result<()> {
        let Some(instance) = self.find(task_id) else {
            if self.cleaned.contains(task_id) {
                log::debug!("[Coordinator] Task {} already cleaned up", task_id);
                return Ok(());
            }
            return Err(ParallelError::UnknownInstance(task_id.to_string()));
        };

        if !instance.can_clean_up() {
            return Err(ParallelError::InvalidTransition {
                task_id: task_id.to_string(),
                from: instance.state,
                to: InstanceState::CleanedUp,
            });
        }

        let workspace = instance.workspace.clone();
        let branch = instance.branch_name.clone();
        if let Err(e) = self.workspaces.remove_workspace(&workspace, force) {
            log::error!("[Coordinator] Cleanup of task {} failed: {}", task_id, e);
            self.emitter.emit(ParallelEvent::CleanupFailed(CleanupFailedPayload {
                task_id: task_id.to_string(),
                branch,
                error: e.to_string(),
                timestamp: timestamp(),
            }));
            return Err(e);
        }

        self.finish(task_id)
    }

    /// Terminate the worker and forcibly tear down the workspace, skipping
    /// any merge. Final; a cancelled instance cannot be resumed.
    ///
    /// Merging and Merged instances are refused, as are Failed and Conflicted
    /// ones nobody has acknowledged.
    pub async fn cancel(&mut self, task_id: &str) -> Result<()> {
        let Some(instance) = self.find(task_id) else {
            if self.cleaned.contains(task_id) {
                return Ok(());
            }
            return Err(ParallelError::UnknownInstance(task_id.to_string()));
        };
        let cancellable = match instance.state {
            InstanceState::Pending
            | InstanceState::Spawning
            | InstanceState::Running
            | InstanceState::Completed => true,
            InstanceState::Failed | InstanceState::Conflicted => instance.can_clean_up(),
            _ => false,
        };
        if !cancellable {
            return Err(ParallelError::InvalidTransition {
                task_id: task_id.to_string(),
                from: instance.state,
                to: InstanceState::CleanedUp,
            });
        }
        let workspace = instance.workspace.clone();
        let branch = instance.branch_name.clone();

        if let Some(mut handle) = self.handles.remove(task_id) {
            log::info!("[Coordinator] Terminating worker for task {}", task_id);
            handle.terminate(TERMINATE_TIMEOUT).await;
        }

        if let Err(e) = self.workspaces.remove_workspace(&workspace, true) {
            log::error!("[Coordinator] Cancel of task {} could not remove workspace: {}", task_id, e);
            self.emitter.emit(ParallelEvent::CleanupFailed(CleanupFailedPayload {
                task_id: task_id.to_string(),
                branch,
                error: e.to_string(),
                timestamp: timestamp(),
            }));
            return Err(e);
        }

        self.finish(task_id)
    }

    /// Shutdown path: stop every worker and remove its workspace, clean up
    /// merged instances, and keep finished, failed and conflicted branches.
    pub async fn cancel_all(&mut self) -> ShutdownResult {
        let mut result = ShutdownResult::default();

        for instance in self.snapshot_instances() {
            let task_id = instance.task_id.as_str();
            match instance.state {
                InstanceState::Pending | InstanceState::Spawning | InstanceState::Running => {
                    match self.cancel(task_id).await {
                        Ok(()) => {
                            result.workers_stopped += 1;
                            result.workspaces_cleaned += 1;
                        }
                        Err(e) => result.errors.push(format!("{}: {}", task_id, e)),
                    }
                }
                InstanceState::Merged => match self.cleanup(task_id, false) {
                    Ok(()) => result.workspaces_cleaned += 1,
                    Err(e) => result.errors.push(format!("{}: {}", task_id, e)),
                },
                state if is_preserved(state) || state == InstanceState::Completed => {
                    result.preserved_branches.push(instance.branch_name.clone())
                }
                _ => {}
            }
        }

        self.persist();
        result
    }

    /// Reload the registry left by a previous run.
    ///
    /// Workers of that run cannot be re-attached, so anything that was still
    /// live becomes Failed ("coordinator restarted"); Merged, Failed and
    /// Conflicted instances keep their state. Instances whose workspace
    /// disappeared are dropped. Returns the recovered task ids.
    pub fn recover(&mut self) -> Result<Vec<String>> {
        let git = GitManager::new(self.workspaces.project_path())?;
        let pruned = git.prune_orphaned_worktrees()?;
        if pruned > 0 {
            log::info!("[Recovery] Pruned {} orphaned worktree(s)", pruned);
        }

        let Some(snapshot) = self.snapshots.read()? else {
            return Ok(Vec::new());
        };

        if snapshot
            .instances
            .iter()
            .any(|i| i.state == InstanceState::Merging)
            && git.has_pending_operation()
        {
            log::warn!("[Recovery] Aborting merge interrupted by the previous run");
            git.merge_abort()?;
        }

        let mut recovered = Vec::new();
        for mut instance in snapshot.instances {
            if instance.state == InstanceState::CleanedUp || self.find(&instance.task_id).is_some() {
                continue;
            }
            if !instance.workspace.path.exists() {
                log::warn!(
                    "[Recovery] Dropping task {}: workspace {:?} no longer exists",
                    instance.task_id,
                    instance.workspace.path
                );
                continue;
            }

            instance.pid = None;
            instance.stalled = false;
            if !matches!(
                instance.state,
                InstanceState::Merged | InstanceState::Failed | InstanceState::Conflicted
            ) {
                instance.state = InstanceState::Failed;
                instance.failure_reason = Some("coordinator restarted".to_string());
                instance.acknowledged = false;
            }

            log::info!(
                "[Recovery] Re-registered task {} as {} (branch {})",
                instance.task_id,
                instance.state,
                instance.branch_name
            );
            recovered.push(instance.task_id.clone());
            self.instances.push(instance);
        }

        self.persist();
        Ok(recovered)
    }

    /// Error describing why a preserved instance did not merge
    pub fn terminal_error(&self, task_id: &str) -> Option<ParallelError> {
        let instance = self.find(task_id)?;
        match instance.state {
            InstanceState::Conflicted => Some(ParallelError::MergeConflict {
                task_id: instance.task_id.clone(),
                branch: instance.branch_name.clone(),
                files: instance.conflicting_files.clone(),
            }),
            InstanceState::Failed => match instance.exit_code {
                Some(code) if code != 0 => Some(ParallelError::ProcessCrash {
                    task_id: instance.task_id.clone(),
                    exit_code: code,
                }),
                _ => Some(ParallelError::Spawn {
                    task_id: instance.task_id.clone(),
                    reason: instance
                        .failure_reason
                        .clone()
                        .unwrap_or_else(|| "worker failed".to_string()),
                }),
            },
            _ => None,
        }
    }

    /// Move to CleanedUp and drop the instance from the registry
    fn finish(&mut self, task_id: &str) -> Result<()> {
        let instance = self.find_mut(task_id)?;
        instance.transition(InstanceState::CleanedUp)?;
        let branch = instance.branch_name.clone();

        self.instances.retain(|i| i.task_id != task_id);
        self.handles.remove(task_id);
        self.completion_order.retain(|id| id != task_id);
        self.merger.clear_conflict(task_id);
        self.cleaned.insert(task_id.to_string());

        self.emitter.emit(ParallelEvent::InstanceCleanedUp(InstanceCleanedUpPayload {
            task_id: task_id.to_string(),
            branch,
            branch_preserved: false,
            timestamp: timestamp(),
        }));
        self.persist();
        Ok(())
    }

    fn find(&self, task_id: &str) -> Option<&TaskInstance> {
        self.instances.iter().find(|i| i.task_id == task_id)
    }

    fn find_mut(&mut self, task_id: &str) -> Result<&mut TaskInstance> {
        self.instances
            .iter_mut()
            .find(|i| i.task_id == task_id)
            .ok_or_else(|| ParallelError::UnknownInstance(task_id.to_string()))
    }

    /// Write the registry snapshot; failures are logged, never raised
    fn persist(&self) {
        if !self.config.execution.snapshot_enabled {
            return;
        }
        if let Err(e) = self
            .snapshots
            .write(&self.run_id, self.primary_branch(), &self.instances)
        {
            log::warn!("[Coordinator] Failed to write snapshot: {}", e);
        }
    }
}
