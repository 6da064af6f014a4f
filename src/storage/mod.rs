//! Durable storage for orchestration state.
//!
//! Three kinds of records are kept: one [`InstanceRecord`] per transaction id,
//! an ordered append-only history of [`HistoryEvent`]s per instance, and the
//! [`ActivityTask`]s that back the remote task queues.

pub mod sled_store;

pub use sled_store::SledStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::activity::{ActivityError, ExecutionMode};
use crate::core::errors::Result;
use crate::orchestration::workflow::{Phase, WorkflowKind};
use crate::transaction::{Transaction, TransactionError, TxResult};

/// Persisted state of one orchestration instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub kind: WorkflowKind,
    pub transaction: Transaction,
    pub phase: Phase,
    pub init_result: Option<std::result::Result<(), ActivityError>>,
    pub final_result: Option<std::result::Result<TxResult, TransactionError>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstanceRecord {
    pub fn new(transaction: Transaction, kind: WorkflowKind) -> Self {
        let now = Utc::now();
        Self {
            instance_id: transaction.id.clone(),
            kind,
            transaction,
            phase: Phase::Created,
            init_result: None,
            final_result: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}

/// One entry in an instance's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryEvent {
    InstanceStarted {
        kind: WorkflowKind,
        transaction: Transaction,
        at: DateTime<Utc>,
    },
    ActivityScheduled {
        seq: u32,
        name: String,
        mode: ExecutionMode,
    },
    ActivityCompleted {
        seq: u32,
        name: String,
        result: std::result::Result<(), ActivityError>,
    },
    PhaseChanged {
        phase: Phase,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityTaskStatus {
    Pending,
    Running,
    Completed,
}

/// A remote activity attempt recorded in a task queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityTask {
    pub task_id: String,
    pub instance_id: String,
    pub seq: u32,
    pub attempt: u32,
    pub activity: String,
    pub queue: String,
    pub transaction: Transaction,
    pub timeout: Option<Duration>,
    /// Past this instant the dispatcher has stopped waiting and the task must not run
    pub deadline: Option<DateTime<Utc>>,
    pub status: ActivityTaskStatus,
    pub result: Option<std::result::Result<(), ActivityError>>,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ActivityTask {
    /// Deterministic id, so a replayed dispatch finds the original task.
    pub fn task_id_for(instance_id: &str, seq: u32, attempt: u32) -> String {
        format!("{instance_id}:{seq}:{attempt}")
    }

    /// Restart the task's time budget from `now`.
    pub fn refresh_deadline(&mut self, now: DateTime<Utc>) {
        self.deadline = self
            .timeout
            .and_then(|t| chrono::Duration::from_std(t).ok())
            .map(|t| now + t);
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }

    /// Time left before the deadline; `None` when the task has no deadline.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.deadline
            .map(|d| (d - now).to_std().unwrap_or(Duration::ZERO))
    }
}

/// Storage trait for orchestration persistence
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Insert a new instance; returns false if the id is already taken
    async fn create_instance(&self, record: &InstanceRecord) -> Result<bool>;

    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>>;

    /// Overwrite an existing instance record
    async fn put_instance(&self, record: &InstanceRecord) -> Result<()>;

    /// All instances that have not reached a terminal phase
    async fn list_open_instances(&self) -> Result<Vec<InstanceRecord>>;

    async fn append_event(&self, instance_id: &str, event: &HistoryEvent) -> Result<()>;

    /// History of an instance in append order
    async fn load_history(&self, instance_id: &str) -> Result<Vec<HistoryEvent>>;

    async fn put_task(&self, task: &ActivityTask) -> Result<()>;

    async fn get_task(&self, task_id: &str) -> Result<Option<ActivityTask>>;

    async fn list_tasks(&self, status: ActivityTaskStatus) -> Result<Vec<ActivityTask>>;

    /// Flush pending writes
    async fn flush(&self) -> Result<()>;
}
