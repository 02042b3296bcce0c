// Admission control with resource limits

use crate::config::ParallelConfig;
use crate::utils::lock_mutex_recover;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use sysinfo::System;

/// Reason returned when the concurrency cap is hit
pub const REASON_MAX_CONCURRENT: &str = "Max concurrent instances reached";

/// Point-in-time host load plus the coordinator's instance count
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSnapshot {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub active_instance_count: usize,
}

/// Outcome of one admission check
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub reason: String,
    pub snapshot: ResourceSnapshot,
}

impl AdmissionDecision {
    pub fn as_tuple(&self) -> (bool, &str) {
        (self.allowed, &self.reason)
    }
}

/// Host CPU and memory utilization, in percent
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostLoad {
    pub cpu_percent: f32,
    pub memory_percent: f32,
}

/// Source of host load readings
pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> HostLoad;
}

/// Reads live utilization through sysinfo
pub struct SystemSampler {
    system: Mutex<System>,
}

impl SystemSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta between refreshes; prime the first one
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SystemSampler {
    fn sample(&self) -> HostLoad {
        let mut system = lock_mutex_recover(&self.system);
        system.refresh_cpu_usage();
        system.refresh_memory();

        let total = system.total_memory();
        let memory_percent = if total == 0 {
            0.0
        } else {
            (system.used_memory() as f64 / total as f64 * 100.0) as f32
        };

        HostLoad {
            cpu_percent: system.global_cpu_usage(),
            memory_percent,
        }
    }
}

/// Always reports the same load
#[derive(Debug, Clone, Copy)]
pub struct FixedSampler(pub HostLoad);

impl FixedSampler {
    pub fn new(cpu_percent: f32, memory_percent: f32) -> Self {
        Self(HostLoad {
            cpu_percent,
            memory_percent,
        })
    }

    pub fn idle() -> Self {
        Self::new(0.0, 0.0)
    }
}

impl ResourceSampler for FixedSampler {
    fn sample(&self) -> HostLoad {
        self.0
    }
}

/// Decides whether another worker may start. Stateless apart from its limits:
/// the active count is supplied by the coordinator on every call.
pub struct ResourceAdmissionController {
    max_concurrent: usize,
    cpu_threshold: f32,
    memory_threshold: f32,
    sampler: Box<dyn ResourceSampler>,
}

impl ResourceAdmissionController {
    pub fn new(
        max_concurrent: usize,
        cpu_threshold: f32,
        memory_threshold: f32,
        sampler: Box<dyn ResourceSampler>,
    ) -> Self {
        Self {
            max_concurrent,
            cpu_threshold,
            memory_threshold,
            sampler,
        }
    }

    /// Controller with limits from config, sampling the live host
    pub fn from_config(config: &ParallelConfig) -> Self {
        Self::with_sampler(config, Box::new(SystemSampler::new()))
    }

    pub fn with_sampler(config: &ParallelConfig, sampler: Box<dyn ResourceSampler>) -> Self {
        Self::new(
            config.execution.max_concurrent,
            config.resources.cpu_threshold,
            config.resources.memory_threshold,
            sampler,
        )
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Sample host load now
    pub fn snapshot(&self, active_instance_count: usize) -> ResourceSnapshot {
        let load = self.sampler.sample();
        ResourceSnapshot {
            cpu_percent: load.cpu_percent,
            memory_percent: load.memory_percent,
            active_instance_count,
        }
    }

    /// Decide whether one more instance may start. No side effects, no queuing.
    pub fn can_admit(&self, active_instance_count: usize) -> AdmissionDecision {
        let snapshot = self.snapshot(active_instance_count);

        let deny = |reason: String| {
            log::info!("[AdmissionController] Denied: {}", reason);
            AdmissionDecision {
                allowed: false,
                reason,
                snapshot,
            }
        };

        if active_instance_count >= self.max_concurrent {
            return deny(REASON_MAX_CONCURRENT.to_string());
        }

        if snapshot.cpu_percent > self.cpu_threshold {
            return deny(format!(
                "CPU usage {:.1}% exceeds threshold {:.1}%",
                snapshot.cpu_percent, self.cpu_threshold
            ));
        }

        if snapshot.memory_percent > self.memory_threshold {
            return deny(format!(
                "Memory usage {:.1}% exceeds threshold {:.1}%",
                snapshot.memory_percent, self.memory_threshold
            ));
        }

        AdmissionDecision {
            allowed: true,
            reason: "Admitted".to_string(),
            snapshot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(max: usize, sampler: FixedSampler) -> ResourceAdmissionController {
        ResourceAdmissionController::new(max, 80.0, 80.0, Box::new(sampler))
    }

    #[test]
    fn test_admits_under_limits() {
        let decision = controller(2, FixedSampler::new(10.0, 20.0)).can_admit(1);
        assert!(decision.allowed);
        assert_eq!(decision.snapshot.active_instance_count, 1);
        assert_eq!(decision.snapshot.cpu_percent, 10.0);
    }

    #[test]
    fn test_denies_at_max_concurrent() {
        let decision = controller(2, FixedSampler::idle()).can_admit(2);
        assert_eq!(decision.as_tuple(), (false, "Max concurrent instances reached"));
    }

    #[test]
    fn test_denies_on_cpu_and_memory() {
        let decision = controller(5, FixedSampler::new(85.0, 10.0)).can_admit(0);
        assert!(!decision.allowed);
        assert!(decision.reason.contains("CPU"));

        let decision = controller(5, FixedSampler::new(10.0, 95.0)).can_admit(0);
        assert!(!decision.allowed);
        assert!(decision.reason.contains("Memory"));

        // Exactly at the threshold is still admitted
        assert!(controller(5, FixedSampler::new(80.0, 80.0)).can_admit(0).allowed);
    }

    #[test]
    fn test_from_config_limits() {
        let mut config = ParallelConfig::default();
        config.execution.max_concurrent = 1;
        let controller =
            ResourceAdmissionController::with_sampler(&config, Box::new(FixedSampler::idle()));
        assert_eq!(controller.max_concurrent(), 1);
        assert!(controller.can_admit(0).allowed);
        assert!(!controller.can_admit(1).allowed);
    }

    #[test]
    fn test_system_sampler_reports_percentages() {
        let load = SystemSampler::new().sample();
        assert!(load.memory_percent >= 0.0 && load.memory_percent <= 100.0);
        assert!(load.cpu_percent >= 0.0);
    }
}
