//! Latency scenarios and the reports they produce.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::orchestration::{FinalResult, Phase, UpdateResult, WorkflowKind};

/// How a driver run starts its instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scenario {
    /// Both phases local, plain start, wait for completion
    LocalActivities,
    /// Both phases remote, update-with-start
    RegularActivities,
    /// Phase 1 local, update-with-start
    UpdateWithStartLocal,
    /// Local activities started on the calling process
    Eager,
}

impl Scenario {
    pub const ALL: [Scenario; 4] = [
        Scenario::LocalActivities,
        Scenario::UpdateWithStartLocal,
        Scenario::RegularActivities,
        Scenario::Eager,
    ];

    pub fn kind(&self) -> WorkflowKind {
        match self {
            Self::LocalActivities | Self::Eager => WorkflowKind::LocalActivities,
            Self::RegularActivities => WorkflowKind::RegularActivities,
            Self::UpdateWithStartLocal => WorkflowKind::UpdateWithStartLocal,
        }
    }

    /// Prefix put in front of the transaction id to form the instance id.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            Self::LocalActivities => "local-activities-latency-optimization-",
            Self::UpdateWithStartLocal => "local-before-update-latency-optimization-workflow-ID-",
            Self::RegularActivities => "regular-activities-latency-optimization-workflow-ID-",
            Self::Eager => "eager-latency-optimization-workflow-ID-",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::LocalActivities => "local",
            Self::RegularActivities => "regular",
            Self::UpdateWithStartLocal => "update-with-start",
            Self::Eager => "eager",
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Scenario {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|scenario| scenario.name() == s)
            .ok_or_else(|| format!("unknown scenario: {s}"))
    }
}

/// Timing and results of one scenario run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub instance_id: String,
    pub scenario: Scenario,
    /// Time until the caller had its first answer. Equal to the final
    /// latency for scenarios without early return.
    pub update_latency_ms: f64,
    pub final_latency_ms: f64,
    pub update_result: Option<UpdateResult>,
    pub final_result: FinalResult,
    pub status: Phase,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionReport {
    pub fn new(
        scenario: Scenario,
        instance_id: impl Into<String>,
        first_response: Duration,
        completion: Duration,
        update_result: Option<UpdateResult>,
        final_result: FinalResult,
        status: Phase,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            scenario,
            update_latency_ms: first_response.as_secs_f64() * 1000.0,
            final_latency_ms: completion.as_secs_f64() * 1000.0,
            update_result,
            final_result,
            status,
            timestamp: Utc::now(),
        }
    }

    /// Share of the completion time saved by returning early.
    pub fn early_return_saving(&self) -> f64 {
        if self.final_latency_ms <= 0.0 {
            return 0.0;
        }
        1.0 - self.update_latency_ms / self.final_latency_ms
    }
}

/// All runs recorded under one request id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunGroup {
    pub request_id: String,
    pub iterations: usize,
    pub results: Vec<ExecutionReport>,
}

impl RunGroup {
    fn latest(&self) -> Option<DateTime<Utc>> {
        self.results.iter().map(|r| r.timestamp).max()
    }
}

/// In-memory report store, grouped by request id.
#[derive(Debug, Default)]
pub struct ResultsStore {
    groups: DashMap<String, RunGroup>,
}

impl ResultsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh request id for a batch of runs.
    pub fn request_id() -> String {
        format!("run_{}", cuid2::create_id())
    }

    pub fn add_run(&self, request_id: &str, iterations: usize, report: ExecutionReport) {
        let mut group = self
            .groups
            .entry(request_id.to_string())
            .or_insert_with(|| RunGroup {
                request_id: request_id.to_string(),
                iterations,
                results: Vec::new(),
            });
        group.iterations = iterations;
        group.results.push(report);
    }

    pub fn get(&self, request_id: &str) -> Option<RunGroup> {
        self.groups.get(request_id).map(|g| g.clone())
    }

    pub fn all(&self) -> Vec<RunGroup> {
        self.groups.iter().map(|g| g.value().clone()).collect()
    }

    /// Groups ordered by their most recent run, newest first.
    pub fn recent(&self, limit: usize) -> Vec<RunGroup> {
        let mut groups = self.all();
        groups.sort_by(|a, b| b.latest().cmp(&a.latest()));
        groups.truncate(limit);
        groups
    }

    pub fn clear(&self, request_id: &str) -> bool {
        self.groups.remove(request_id).is_some()
    }

    pub fn clear_all(&self) {
        self.groups.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TxResult;
    use pretty_assertions::assert_eq;

    fn report(id: &str, at: DateTime<Utc>) -> ExecutionReport {
        let mut report = ExecutionReport::new(
            Scenario::UpdateWithStartLocal,
            id,
            Duration::from_millis(25),
            Duration::from_millis(100),
            Some(Ok(TxResult::initialized(id))),
            Ok(TxResult::completed(id)),
            Phase::Completed,
        );
        report.timestamp = at;
        report
    }

    #[test]
    fn test_scenario_names() {
        for scenario in Scenario::ALL {
            assert_eq!(scenario.name().parse::<Scenario>(), Ok(scenario));
        }
        assert_eq!(Scenario::Eager.kind(), WorkflowKind::LocalActivities);
    }

    #[test]
    fn test_early_return_saving() {
        let report = report("t1", Utc::now());
        assert!((report.early_return_saving() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_results_store_groups_and_orders() {
        let store = ResultsStore::new();
        let earlier = Utc::now() - chrono::Duration::seconds(10);
        let later = Utc::now();

        store.add_run("a", 2, report("a-1", earlier));
        store.add_run("a", 2, report("a-2", earlier));
        store.add_run("b", 1, report("b-1", later));

        assert_eq!(store.get("a").unwrap().results.len(), 2);
        assert_eq!(store.all().len(), 2);

        let recent = store.recent(1);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].request_id, "b");

        assert!(store.clear("a"));
        assert!(!store.clear("a"));
        store.clear_all();
        assert!(store.all().is_empty());
    }

    #[test]
    fn test_request_ids_are_unique() {
        assert_ne!(ResultsStore::request_id(), ResultsStore::request_id());
    }
}
