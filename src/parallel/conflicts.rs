// Static separation analysis over pending tasks

use crate::config::SeparationConfig;
use crate::error::{ParallelError, Result};
use crate::models::TaskDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

/// Whether a set of tasks may run concurrently
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    /// No shared files
    Safe,
    /// Few shared files; admitted but watched closely at merge time
    Caution,
    /// Must not run concurrently
    Unsafe,
}

impl std::fmt::Display for Recommendation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Recommendation::Safe => write!(f, "safe"),
            Recommendation::Caution => write!(f, "caution"),
            Recommendation::Unsafe => write!(f, "unsafe"),
        }
    }
}

/// Overlap between two tasks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PairOverlap {
    pub first: String,
    pub second: String,
    pub shared_files: BTreeSet<String>,
    pub recommendation: Recommendation,
}

impl PairOverlap {
    /// Other side of the pair if `task_id` is one side
    pub fn other(&self, task_id: &str) -> Option<&str> {
        if self.first == task_id {
            Some(&self.second)
        } else if self.second == task_id {
            Some(&self.first)
        } else {
            None
        }
    }
}

/// Result of one analysis. Built once, read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SeparationReport {
    task_ids: Vec<String>,
    file_impacts_by_task: BTreeMap<String, BTreeSet<String>>,
    shared_files: BTreeSet<String>,
    overlaps: Vec<PairOverlap>,
    confidence_score: u8,
    recommendation: Recommendation,
    strategy: String,
}

impl SeparationReport {
    pub fn task_ids(&self) -> &[String] {
        &self.task_ids
    }

    pub fn file_impacts_by_task(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.file_impacts_by_task
    }

    /// Files touched by two or more tasks
    pub fn shared_files(&self) -> &BTreeSet<String> {
        &self.shared_files
    }

    /// Every task pair that shares at least one file
    pub fn overlaps(&self) -> &[PairOverlap] {
        &self.overlaps
    }

    pub fn confidence_score(&self) -> u8 {
        self.confidence_score
    }

    pub fn recommendation(&self) -> Recommendation {
        self.recommendation
    }

    pub fn strategy(&self) -> &str {
        &self.strategy
    }

    /// Tasks that must not run alongside `task_id`, with the files they share
    pub fn unsafe_partners(&self, task_id: &str) -> Vec<(&str, &BTreeSet<String>)> {
        self.overlaps
            .iter()
            .filter(|o| o.recommendation == Recommendation::Unsafe)
            .filter_map(|o| o.other(task_id).map(|other| (other, &o.shared_files)))
            .collect()
    }
}

/// Pluggable impact detection and scoring
pub trait SeparationStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Files a task is expected to touch
    fn impact_set(&self, task: &TaskDescriptor) -> Result<BTreeSet<String>>;

    /// Files both impact sets touch
    fn overlap(&self, a: &BTreeSet<String>, b: &BTreeSet<String>) -> BTreeSet<String>;

    /// Confidence and recommendation for a set of shared files
    fn score(&self, shared: &BTreeSet<String>) -> (u8, Recommendation);
}

/// Conservative heuristic over declared file-impact hints.
///
/// A hint naming a directory overlaps every path beneath it. Sharing any
/// configured critical file (manifests, lock files, config) is always Unsafe.
pub struct FileOverlapStrategy {
    config: SeparationConfig,
}

impl FileOverlapStrategy {
    pub fn new(config: SeparationConfig) -> Self {
        Self { config }
    }

    fn is_critical(&self, path: &str) -> bool {
        let file_name = Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(path);
        self.config
            .critical_files
            .iter()
            .any(|critical| critical == file_name || critical == path)
    }
}

impl SeparationStrategy for FileOverlapStrategy {
    fn name(&self) -> &str {
        "file_overlap"
    }

    fn impact_set(&self, task: &TaskDescriptor) -> Result<BTreeSet<String>> {
        task.file_impact_hints
            .iter()
            .map(|hint| normalize_hint(&task.id, hint))
            .collect()
    }

    fn overlap(&self, a: &BTreeSet<String>, b: &BTreeSet<String>) -> BTreeSet<String> {
        let mut shared = BTreeSet::new();
        for left in a {
            for right in b {
                if left == right || is_within(right, left) {
                    shared.insert(right.clone());
                } else if is_within(left, right) {
                    shared.insert(left.clone());
                }
            }
        }
        shared
    }

    fn score(&self, shared: &BTreeSet<String>) -> (u8, Recommendation) {
        let count = shared.len();
        let cfg = &self.config;

        if count == 0 {
            return (cfg.safe_confidence, Recommendation::Safe);
        }

        let critical = shared.iter().any(|path| self.is_critical(path));
        if !critical && count <= cfg.caution_max_shared {
            let penalty = 5 * (count - 1).min(50) as u8;
            return (cfg.caution_confidence.saturating_sub(penalty), Recommendation::Caution);
        }

        let extra = count.saturating_sub(cfg.caution_max_shared + 1).min(50) as u8;
        (cfg.unsafe_confidence.saturating_sub(5 * extra), Recommendation::Unsafe)
    }
}

/// Runs a separation strategy over a candidate set of tasks
pub struct TaskSeparationAnalyzer {
    strategy: Box<dyn SeparationStrategy>,
}

impl TaskSeparationAnalyzer {
    /// Analyzer using the file-overlap heuristic
    pub fn new(config: SeparationConfig) -> Self {
        Self::with_strategy(Box::new(FileOverlapStrategy::new(config)))
    }

    pub fn with_strategy(strategy: Box<dyn SeparationStrategy>) -> Self {
        Self { strategy }
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    /// Check a single descriptor without comparing it to anything
    pub fn validate(&self, task: &TaskDescriptor) -> Result<()> {
        if task.id.trim().is_empty() {
            return Err(ParallelError::SeparationAnalysis(
                "task id must not be empty".to_string(),
            ));
        }
        self.strategy.impact_set(task).map(|_| ())
    }

    /// Estimate whether `tasks` can run concurrently. Requires at least two tasks.
    pub fn analyze(&self, tasks: &[TaskDescriptor]) -> Result<SeparationReport> {
        if tasks.len() < 2 {
            return Err(ParallelError::SeparationAnalysis(format!(
                "analysis needs at least 2 tasks, got {}",
                tasks.len()
            )));
        }

        let mut seen = HashSet::new();
        let mut impacts = Vec::with_capacity(tasks.len());
        for task in tasks {
            if task.id.trim().is_empty() {
                return Err(ParallelError::SeparationAnalysis(
                    "task id must not be empty".to_string(),
                ));
            }
            if !seen.insert(task.id.as_str()) {
                return Err(ParallelError::SeparationAnalysis(format!(
                    "duplicate task id '{}'",
                    task.id
                )));
            }
            impacts.push((task.id.clone(), self.strategy.impact_set(task)?));
        }

        let mut shared_files = BTreeSet::new();
        let mut overlaps = Vec::new();
        for (i, (first, first_set)) in impacts.iter().enumerate() {
            for (second, second_set) in impacts.iter().skip(i + 1) {
                let shared = self.strategy.overlap(first_set, second_set);
                if shared.is_empty() {
                    continue;
                }
                let (_, recommendation) = self.strategy.score(&shared);
                shared_files.extend(shared.iter().cloned());
                overlaps.push(PairOverlap {
                    first: first.clone(),
                    second: second.clone(),
                    shared_files: shared,
                    recommendation,
                });
            }
        }

        let (mut confidence_score, mut recommendation) = self.strategy.score(&shared_files);
        // The set is never safer than its worst pair
        if let Some(worst) = overlaps.iter().max_by_key(|o| o.recommendation) {
            if worst.recommendation > recommendation {
                recommendation = worst.recommendation;
                confidence_score = confidence_score.min(self.strategy.score(&worst.shared_files).0);
            }
        }

        log::debug!(
            "[Separation] {} task(s), {} shared file(s) -> {} ({})",
            tasks.len(),
            shared_files.len(),
            recommendation,
            confidence_score
        );

        Ok(SeparationReport {
            task_ids: impacts.iter().map(|(id, _)| id.clone()).collect(),
            file_impacts_by_task: impacts.into_iter().collect(),
            shared_files,
            overlaps,
            confidence_score,
            recommendation,
            strategy: self.strategy.name().to_string(),
        })
    }
}

/// Normalize one impact hint to a clean repository-relative path
fn normalize_hint(task_id: &str, hint: &str) -> Result<String> {
    let malformed = |why: &str| {
        ParallelError::SeparationAnalysis(format!(
            "task '{}' has {} impact hint '{}'",
            task_id, why, hint
        ))
    };

    let unified = hint.trim().replace('\\', "/");
    if unified.is_empty() {
        return Err(malformed("an empty"));
    }
    if unified.starts_with('/') || unified.chars().nth(1) == Some(':') {
        return Err(malformed("an absolute"));
    }

    let mut parts = Vec::new();
    for part in unified.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(malformed("an escaping")),
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Err(malformed("an empty"));
    }

    Ok(parts.join("/"))
}

/// Whether `path` lies strictly beneath directory `dir`
fn is_within(path: &str, dir: &str) -> bool {
    path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
}
