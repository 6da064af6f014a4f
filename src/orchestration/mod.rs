//! Instance orchestration: the transaction state machine, the readiness gate
//! that backs early return, and the engine that hosts running instances.

pub mod context;
pub mod engine;
pub mod gate;
pub mod metrics;
pub mod workflow;

pub use context::OrchestrationContext;
pub use engine::{
    Engine, FinalResult, IdConflictPolicy, InstanceDescription, StartOptions, StartOutcome,
    UpdateResult,
};
pub use gate::{InitGate, InitOutcome};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use workflow::{Phase, TransactionWorkflow, WorkflowKind};
