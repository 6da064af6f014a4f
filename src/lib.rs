// Core infrastructure modules
pub mod core;
pub mod storage;
pub mod queue;

// Domain: transactions and the activities that act on them
pub mod transaction;
pub mod activity;

// Execution: instance orchestration, workers and the client driver
pub mod orchestration;
pub mod worker;
pub mod client;

// HTTP surface over the client
pub mod api;

// Re-exports for convenience
pub use core::config::{FlowConfig, TASK_QUEUE_NAME, UPDATE_NAME};
pub use core::connection::ConnectionOptions;
pub use core::errors::{FlowError, Result};

pub use activity::{
    register_all, Activity, ActivityError, ActivityOptions, ActivityRegistry, ExecutionMode,
    RetryPolicy, TransactionLatencies, TransactionLedger,
};
pub use client::{Client, ExecutionReport, ResultsStore, RunGroup, Scenario, WorkflowHandle};
pub use orchestration::{
    Engine, IdConflictPolicy, InitGate, InstanceDescription, MetricsSnapshot, Phase, StartOptions,
    WorkflowKind,
};
pub use storage::{HistoryStore, SledStore};
pub use transaction::{FailureClass, Transaction, TransactionError, TxResult};
pub use worker::{RecoveryStats, WorkerHandle, WorkerOptions, WorkerPool};
