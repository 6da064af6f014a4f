//! Instance lifecycle counters for an [`Engine`](super::Engine).

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Instances created by `start`
    pub instances_started: AtomicU64,
    /// Instances that reached `Completed`
    pub instances_completed: AtomicU64,
    /// Instances that reached `Cancelled`
    pub instances_cancelled: AtomicU64,
    /// Instances that reached `Failed`
    pub instances_failed: AtomicU64,
    /// Instances resumed from persisted history
    pub instances_recovered: AtomicU64,
    /// Swallowed `RegisterTransactionID` failures
    pub registration_failures: AtomicU64,
    /// Activity results served from history instead of re-executed
    pub activities_replayed: AtomicU64,
    /// Sum of phase-1 durations, for the running average
    pub total_init_time_ms: AtomicU64,
    pub init_samples: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_started(&self) {
        self.instances_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.instances_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.instances_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.instances_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recovered(&self) {
        self.instances_recovered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_registration_failure(&self) {
        self.registration_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replayed_activity(&self) {
        self.activities_replayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_init_duration(&self, elapsed: Duration) {
        self.total_init_time_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        self.init_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let samples = self.init_samples.load(Ordering::Relaxed);
        let total = self.total_init_time_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            instances_started: self.instances_started.load(Ordering::Relaxed),
            instances_completed: self.instances_completed.load(Ordering::Relaxed),
            instances_cancelled: self.instances_cancelled.load(Ordering::Relaxed),
            instances_failed: self.instances_failed.load(Ordering::Relaxed),
            instances_recovered: self.instances_recovered.load(Ordering::Relaxed),
            registration_failures: self.registration_failures.load(Ordering::Relaxed),
            activities_replayed: self.activities_replayed.load(Ordering::Relaxed),
            avg_init_time_ms: if samples == 0 { 0 } else { total / samples },
            init_samples: samples,
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub instances_started: u64,
    pub instances_completed: u64,
    pub instances_cancelled: u64,
    pub instances_failed: u64,
    pub instances_recovered: u64,
    pub registration_failures: u64,
    pub activities_replayed: u64,
    pub avg_init_time_ms: u64,
    /// Phase-1 runs that contributed to the average
    pub init_samples: u64,
}

impl MetricsSnapshot {
    /// Instances started but not yet terminal
    pub fn in_flight(&self) -> u64 {
        (self.instances_started + self.instances_recovered).saturating_sub(
            self.instances_completed + self.instances_cancelled + self.instances_failed,
        )
    }
}
