//! Activities: the named, side-effecting steps an orchestration runs.
//!
//! An activity runs either in-process ([`ExecutionMode::Local`]) or through a
//! durable task queue serviced by a worker pool ([`ExecutionMode::Remote`]).
//! Both paths go through [`ActivityExecutor::execute`], which applies the
//! caller's timeout envelope and retry policy uniformly.

pub mod executor;
pub mod transaction_activities;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::core::errors::{FlowError, Result};
use crate::transaction::Transaction;

pub use executor::{ActivityCall, ActivityExecutor, ActivityInvocation};
pub use transaction_activities::{
    CancelTransaction, CompleteTransaction, InitTransaction, LedgerEntry, RegisterTransactionId,
    TransactionLedger, TransactionLatencies, CANCEL_TRANSACTION, COMPLETE_TRANSACTION,
    INIT_TRANSACTION, REGISTER_TRANSACTION_ID, register_all,
};

/// Where an activity runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// In the orchestrating process, with no queue round trip
    Local,
    /// On any worker polling the named task queue
    Remote { queue: String },
}

impl ExecutionMode {
    pub fn remote(queue: impl Into<String>) -> Self {
        Self::Remote {
            queue: queue.into(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote { .. } => "remote",
        }
    }
}

/// Failure of a single activity call.
///
/// `Rejected` is a failed precondition and is never retried. `Timeout` and
/// `Unavailable` are retried while the schedule-to-close envelope allows it.
/// `ExecutionFailed` is retried only if the policy opts in.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ActivityError {
    #[error("{activity} timed out after {timeout_ms}ms")]
    Timeout { activity: String, timeout_ms: u64 },

    #[error("{reason}")]
    Rejected { activity: String, reason: String },

    #[error("{activity} failed: {message}")]
    ExecutionFailed { activity: String, message: String },

    #[error("{activity} unavailable: {message}")]
    Unavailable { activity: String, message: String },
}

impl ActivityError {
    pub fn timeout(activity: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            activity: activity.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn rejected(activity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Rejected {
            activity: activity.into(),
            reason: reason.into(),
        }
    }

    pub fn execution_failed(activity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            activity: activity.into(),
            message: message.into(),
        }
    }

    pub fn unavailable(activity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            activity: activity.into(),
            message: message.into(),
        }
    }

    pub fn activity(&self) -> &str {
        match self {
            Self::Timeout { activity, .. }
            | Self::Rejected { activity, .. }
            | Self::ExecutionFailed { activity, .. }
            | Self::Unavailable { activity, .. } => activity,
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether another attempt may be made under `policy`.
    pub fn is_retryable(&self, policy: &RetryPolicy) -> bool {
        match self {
            Self::Rejected { .. } => false,
            Self::Timeout { .. } | Self::Unavailable { .. } => true,
            Self::ExecutionFailed { .. } => policy.retry_execution_failures,
        }
    }
}

/// Exponential backoff applied between attempts of one activity call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Upper bound on attempts; 0 means unlimited within the envelope
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub maximum_interval: Duration,
    /// Retry `ExecutionFailed` as well as transient errors
    pub retry_execution_failures: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_interval: Duration::from_millis(100),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(10),
            retry_execution_failures: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.backoff_coefficient < 1.0 {
            return Err("backoff_coefficient must be >= 1.0".to_string());
        }
        if self.initial_interval > self.maximum_interval {
            return Err("initial_interval cannot exceed maximum_interval".to_string());
        }
        Ok(())
    }

    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt <= self.max_attempts
    }

    /// Delay before attempt `attempt + 1`, jittered by up to 20%.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = base.min(self.maximum_interval.as_secs_f64());
        let jitter = 1.0 - fastrand::f64() * 0.2;
        Duration::from_secs_f64(capped * jitter)
    }
}

/// How one activity call is run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityOptions {
    pub mode: ExecutionMode,
    /// Total budget across all attempts, measured from the first call
    pub schedule_to_close: Option<Duration>,
    /// Budget for one attempt
    pub start_to_close: Option<Duration>,
    pub retry: RetryPolicy,
}

impl ActivityOptions {
    pub fn local() -> Self {
        Self {
            mode: ExecutionMode::Local,
            schedule_to_close: None,
            start_to_close: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn remote(queue: impl Into<String>) -> Self {
        Self {
            mode: ExecutionMode::remote(queue),
            ..Self::local()
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn schedule_to_close(mut self, timeout: Duration) -> Self {
        self.schedule_to_close = Some(timeout);
        self
    }

    pub fn start_to_close(mut self, timeout: Duration) -> Self {
        self.start_to_close = Some(timeout);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }
}

/// A named step executed against a transaction.
#[async_trait]
pub trait Activity: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, tx: &Transaction) -> std::result::Result<(), ActivityError>;
}

/// Name-to-implementation map shared by the executor and the workers.
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    activities: Arc<DashMap<String, Arc<dyn Activity>>>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, activity: Arc<dyn Activity>) -> Result<()> {
        let name = activity.name().to_string();
        match self.activities.entry(name) {
            dashmap::mapref::entry::Entry::Occupied(entry) => Err(FlowError::configuration_field(
                format!("activity already registered: {}", entry.key()),
                "activity",
            )),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(activity);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Activity>> {
        self.activities.get(name).map(|a| Arc::clone(a.value()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.activities.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.activities.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
