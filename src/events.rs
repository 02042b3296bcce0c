// Event types and payload structures for the notification collaborator
// Forwarded by the embedding application to human-facing channels

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

// Event name constants
pub const EVENT_INSTANCE_SPAWNED: &str = "instance:spawned";
pub const EVENT_INSTANCE_COMPLETED: &str = "instance:completed";
pub const EVENT_INSTANCE_FAILED: &str = "instance:failed";
pub const EVENT_INSTANCE_STALLED: &str = "instance:stalled";
pub const EVENT_INSTANCE_CLEANED_UP: &str = "instance:cleaned_up";

pub const EVENT_MERGE_SUCCEEDED: &str = "merge:succeeded";
pub const EVENT_MERGE_CONFLICTED: &str = "merge:conflicted";

pub const EVENT_ADMISSION_DENIED: &str = "admission:denied";
pub const EVENT_SEPARATION_BLOCKED: &str = "separation:blocked";
pub const EVENT_CLEANUP_FAILED: &str = "cleanup:failed";

/// Payload for instance spawned events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpawnedPayload {
    pub task_id: String,
    pub branch: String,
    pub workspace_path: String,
    pub pid: Option<u32>,
    /// Separation recommendation at admission time, if other tasks were active
    pub recommendation: Option<String>,
    pub timestamp: String,
}

/// Payload for instance completed events (worker exited 0, workspace clean)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceCompletedPayload {
    pub task_id: String,
    pub branch: String,
    pub timestamp: String,
}

/// Payload for instance failed events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceFailedPayload {
    pub task_id: String,
    pub branch: String,
    pub exit_code: Option<i32>,
    pub reason: String,
    pub timestamp: String,
}

/// Payload for instance stalled events (running longer than allowed)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStalledPayload {
    pub task_id: String,
    pub branch: String,
    pub running_secs: u64,
    pub timestamp: String,
}

/// Payload for instance cleaned up events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceCleanedUpPayload {
    pub task_id: String,
    pub branch: String,
    pub branch_preserved: bool,
    pub timestamp: String,
}

/// Payload for merge succeeded events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MergeSucceededPayload {
    pub task_id: String,
    pub source_branch: String,
    pub target_branch: String,
    pub commit_id: Option<String>,
    pub fast_forward: bool,
    pub timestamp: String,
}

/// Payload for merge conflicted events. The workspace is preserved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MergeConflictedPayload {
    pub task_id: String,
    pub source_branch: String,
    pub target_branch: String,
    pub conflicting_files: Vec<String>,
    pub workspace_path: String,
    pub timestamp: String,
}

/// Payload for admission denied events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionDeniedPayload {
    pub task_id: String,
    pub reason: String,
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub active_instance_count: usize,
    pub timestamp: String,
}

/// Payload for separation blocked events (Unsafe against an active task)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SeparationBlockedPayload {
    pub task_id: String,
    pub conflicts_with: Vec<String>,
    pub shared_files: Vec<String>,
    pub confidence_score: u8,
    pub timestamp: String,
}

/// Payload for cleanup failed events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CleanupFailedPayload {
    pub task_id: String,
    pub branch: String,
    pub error: String,
    pub timestamp: String,
}

/// Every structured event the engine emits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "payload")]
pub enum ParallelEvent {
    #[serde(rename = "instance:spawned")]
    InstanceSpawned(InstanceSpawnedPayload),
    #[serde(rename = "instance:completed")]
    InstanceCompleted(InstanceCompletedPayload),
    #[serde(rename = "instance:failed")]
    InstanceFailed(InstanceFailedPayload),
    #[serde(rename = "instance:stalled")]
    InstanceStalled(InstanceStalledPayload),
    #[serde(rename = "instance:cleaned_up")]
    InstanceCleanedUp(InstanceCleanedUpPayload),
    #[serde(rename = "merge:succeeded")]
    MergeSucceeded(MergeSucceededPayload),
    #[serde(rename = "merge:conflicted")]
    MergeConflicted(MergeConflictedPayload),
    #[serde(rename = "admission:denied")]
    AdmissionDenied(AdmissionDeniedPayload),
    #[serde(rename = "separation:blocked")]
    SeparationBlocked(SeparationBlockedPayload),
    #[serde(rename = "cleanup:failed")]
    CleanupFailed(CleanupFailedPayload),
}

impl ParallelEvent {
    /// Event name, matching the serialized tag
    pub fn name(&self) -> &'static str {
        match self {
            ParallelEvent::InstanceSpawned(_) => EVENT_INSTANCE_SPAWNED,
            ParallelEvent::InstanceCompleted(_) => EVENT_INSTANCE_COMPLETED,
            ParallelEvent::InstanceFailed(_) => EVENT_INSTANCE_FAILED,
            ParallelEvent::InstanceStalled(_) => EVENT_INSTANCE_STALLED,
            ParallelEvent::InstanceCleanedUp(_) => EVENT_INSTANCE_CLEANED_UP,
            ParallelEvent::MergeSucceeded(_) => EVENT_MERGE_SUCCEEDED,
            ParallelEvent::MergeConflicted(_) => EVENT_MERGE_CONFLICTED,
            ParallelEvent::AdmissionDenied(_) => EVENT_ADMISSION_DENIED,
            ParallelEvent::SeparationBlocked(_) => EVENT_SEPARATION_BLOCKED,
            ParallelEvent::CleanupFailed(_) => EVENT_CLEANUP_FAILED,
        }
    }

    /// Task the event concerns
    pub fn task_id(&self) -> &str {
        match self {
            ParallelEvent::InstanceSpawned(p) => &p.task_id,
            ParallelEvent::InstanceCompleted(p) => &p.task_id,
            ParallelEvent::InstanceFailed(p) => &p.task_id,
            ParallelEvent::InstanceStalled(p) => &p.task_id,
            ParallelEvent::InstanceCleanedUp(p) => &p.task_id,
            ParallelEvent::MergeSucceeded(p) => &p.task_id,
            ParallelEvent::MergeConflicted(p) => &p.task_id,
            ParallelEvent::AdmissionDenied(p) => &p.task_id,
            ParallelEvent::SeparationBlocked(p) => &p.task_id,
            ParallelEvent::CleanupFailed(p) => &p.task_id,
        }
    }
}

/// Current time in the format used by every payload
pub fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Sends events to the embedding application, if it listens.
/// Emission never fails the caller.
#[derive(Debug, Clone, Default)]
pub struct EventEmitter {
    tx: Option<mpsc::UnboundedSender<ParallelEvent>>,
}

impl EventEmitter {
    pub fn new(tx: mpsc::UnboundedSender<ParallelEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// An emitter that drops every event
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Create an emitter together with its receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ParallelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn emit(&self, event: ParallelEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        let name = event.name();
        if tx.send(event).is_err() {
            log::debug!("[Events] Receiver dropped, discarding {}", name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_constants() {
        assert_eq!(EVENT_INSTANCE_SPAWNED, "instance:spawned");
        assert_eq!(EVENT_MERGE_SUCCEEDED, "merge:succeeded");
        assert_eq!(EVENT_MERGE_CONFLICTED, "merge:conflicted");
        assert_eq!(EVENT_ADMISSION_DENIED, "admission:denied");
    }

    #[test]
    fn test_merge_conflicted_serialization() {
        let event = ParallelEvent::MergeConflicted(MergeConflictedPayload {
            task_id: "T-1".to_string(),
            source_branch: "task/T-1".to_string(),
            target_branch: "main".to_string(),
            conflicting_files: vec!["config.yaml".to_string()],
            workspace_path: "/repo/.worktrees/T-1".to_string(),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
        });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "merge:conflicted");
        assert_eq!(json["payload"]["taskId"], "T-1");
        assert_eq!(json["payload"]["conflictingFiles"][0], "config.yaml");
        assert_eq!(event.name(), EVENT_MERGE_CONFLICTED);

        let back: ParallelEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_emitter_delivers_and_tolerates_closed_channel() {
        let (emitter, mut rx) = EventEmitter::channel();
        let event = ParallelEvent::InstanceCompleted(InstanceCompletedPayload {
            task_id: "T-2".to_string(),
            branch: "task/T-2".to_string(),
            timestamp: timestamp(),
        });

        emitter.emit(event.clone());
        assert_eq!(rx.try_recv().unwrap(), event);

        drop(rx);
        emitter.emit(event.clone());
        EventEmitter::disabled().emit(event);
    }
}
