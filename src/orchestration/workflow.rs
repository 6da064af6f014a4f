//! The two-phase transaction state machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;
use tracing::{error, info, warn};

use super::context::OrchestrationContext;
use super::gate::InitGate;
use crate::activity::{
    ActivityError, ActivityOptions, ExecutionMode, CANCEL_TRANSACTION, COMPLETE_TRANSACTION,
    INIT_TRANSACTION, REGISTER_TRANSACTION_ID,
};
use crate::core::config::FlowConfig;
use crate::transaction::{TransactionError, TxResult};

/// Which execution mode each phase uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowKind {
    /// Phase 1 local, phase 2 remote
    UpdateWithStartLocal,
    /// Both phases remote
    RegularActivities,
    /// Both phases local
    LocalActivities,
}

impl WorkflowKind {
    pub const ALL: [WorkflowKind; 3] = [
        WorkflowKind::UpdateWithStartLocal,
        WorkflowKind::RegularActivities,
        WorkflowKind::LocalActivities,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::UpdateWithStartLocal => "UpdateWithStartLocalActivities",
            Self::RegularActivities => "RegularActivities",
            Self::LocalActivities => "LocalActivities",
        }
    }

    pub fn init_mode(&self, task_queue: &str) -> ExecutionMode {
        match self {
            Self::UpdateWithStartLocal | Self::LocalActivities => ExecutionMode::Local,
            Self::RegularActivities => ExecutionMode::remote(task_queue),
        }
    }

    pub fn finalize_mode(&self, task_queue: &str) -> ExecutionMode {
        match self {
            Self::LocalActivities => ExecutionMode::Local,
            Self::UpdateWithStartLocal | Self::RegularActivities => {
                ExecutionMode::remote(task_queue)
            }
        }
    }
}

impl fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for WorkflowKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UpdateWithStartLocalActivities" | "update-with-start" => {
                Ok(Self::UpdateWithStartLocal)
            }
            "RegularActivities" | "regular" => Ok(Self::RegularActivities),
            "LocalActivities" | "local" => Ok(Self::LocalActivities),
            other => Err(format!("unknown workflow kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Created,
    Registering,
    Initializing,
    InitSucceeded,
    InitFailed,
    Cancelling,
    Cancelled,
    Completing,
    Completed,
    Failed,
}

impl Phase {
    pub fn can_transition_to(&self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Created, Registering)
                | (Registering, Initializing)
                | (Initializing, InitSucceeded)
                | (Initializing, InitFailed)
                | (InitFailed, Cancelling)
                | (Cancelling, Cancelled)
                | (InitSucceeded, Completing)
                | (Completing, Completed)
                | (Completing, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Cancelled | Phase::Completed | Phase::Failed)
    }

    /// Whether phase 1 has finished in this phase.
    pub fn is_initialized(&self) -> bool {
        !matches!(self, Phase::Created | Phase::Registering | Phase::Initializing)
    }
}

/// Register, init, then cancel or complete one transaction.
pub struct TransactionWorkflow {
    kind: WorkflowKind,
    init_options: ActivityOptions,
    finalize_options: ActivityOptions,
}

impl TransactionWorkflow {
    pub fn new(kind: WorkflowKind, config: &FlowConfig) -> Self {
        let init_options = ActivityOptions::local()
            .with_mode(kind.init_mode(&config.task_queue))
            .schedule_to_close(config.init_timeout)
            .retry(config.init_retry.clone());
        let finalize_options = ActivityOptions::local()
            .with_mode(kind.finalize_mode(&config.task_queue))
            .start_to_close(config.finalize_timeout)
            .schedule_to_close(config.finalize_timeout)
            .retry(config.finalize_retry.clone());
        Self {
            kind,
            init_options,
            finalize_options,
        }
    }

    pub fn kind(&self) -> WorkflowKind {
        self.kind
    }

    /// Drive the instance to a terminal phase.
    ///
    /// The gate is signalled exactly once, as soon as phase 1 has an outcome.
    pub async fn run(
        &self,
        ctx: &mut OrchestrationContext,
        gate: &InitGate,
    ) -> Result<TxResult, TransactionError> {
        ctx.transition(Phase::Registering).await;
        if let Err(err) = ctx
            .execute_activity(REGISTER_TRANSACTION_ID, &self.init_options)
            .await
        {
            warn!(
                instance_id = %ctx.instance_id(),
                error = %err,
                "transaction id registration failed",
            );
            ctx.metrics().record_registration_failure();
        }

        ctx.transition(Phase::Initializing).await;
        let replayed = ctx.will_replay(INIT_TRANSACTION);
        let started = Instant::now();
        let init = ctx
            .execute_activity(INIT_TRANSACTION, &self.init_options)
            .await;
        if !replayed {
            ctx.metrics().record_init_duration(started.elapsed());
        }

        let next = if init.is_ok() {
            Phase::InitSucceeded
        } else {
            Phase::InitFailed
        };
        ctx.transition(next).await;
        ctx.record_init_outcome(&init).await;
        gate.signal_ready(init.clone());

        match init {
            Err(init_error) => self.cancel(ctx, init_error).await,
            Ok(()) => self.complete(ctx).await,
        }
    }

    async fn cancel(
        &self,
        ctx: &mut OrchestrationContext,
        init_error: ActivityError,
    ) -> Result<TxResult, TransactionError> {
        error!(
            instance_id = %ctx.instance_id(),
            error = %init_error,
            "cancelling transaction due to init error",
        );
        ctx.transition(Phase::Cancelling).await;
        let cancelled = ctx
            .execute_activity(CANCEL_TRANSACTION, &self.finalize_options)
            .await;
        ctx.transition(Phase::Cancelled).await;

        match cancelled {
            Ok(()) => Err(TransactionError::InitFailed(init_error)),
            Err(cause) => {
                error!(
                    instance_id = %ctx.instance_id(),
                    error = %cause,
                    "cancelling the transaction failed",
                );
                Err(TransactionError::CancellationFailed { init_error, cause })
            }
        }
    }

    async fn complete(&self, ctx: &mut OrchestrationContext) -> Result<TxResult, TransactionError> {
        info!(instance_id = %ctx.instance_id(), "completing transaction");
        ctx.transition(Phase::Completing).await;
        match ctx
            .execute_activity(COMPLETE_TRANSACTION, &self.finalize_options)
            .await
        {
            Ok(()) => {
                ctx.transition(Phase::Completed).await;
                Ok(TxResult::completed(ctx.instance_id()))
            }
            Err(err) => {
                error!(
                    instance_id = %ctx.instance_id(),
                    error = %err,
                    "completing the transaction failed",
                );
                ctx.transition(Phase::Failed).await;
                Err(TransactionError::CompletionFailed(err))
            }
        }
    }
}
