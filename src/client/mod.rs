//! Client side: starting transactions, early return and result handles.

pub mod report;

pub use report::{ExecutionReport, ResultsStore, RunGroup, Scenario};

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::core::config::UPDATE_NAME;
use crate::core::connection::ConnectionOptions;
use crate::core::errors::{FlowError, Result};
use crate::orchestration::{
    Engine, FinalResult, IdConflictPolicy, InstanceDescription, StartOptions, UpdateResult,
    WorkflowKind,
};
use crate::transaction::Transaction;

pub struct Client {
    engine: Arc<Engine>,
    connection: ConnectionOptions,
    rpc_timeout: Duration,
}

impl Client {
    pub fn new(engine: Arc<Engine>, connection: ConnectionOptions) -> Self {
        let rpc_timeout = engine.config().rpc_timeout;
        Self {
            engine,
            connection,
            rpc_timeout,
        }
    }

    pub fn connection(&self) -> &ConnectionOptions {
        &self.connection
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Start an instance for a worker to pick up.
    pub async fn start(&self, tx: Transaction, kind: WorkflowKind) -> Result<WorkflowHandle> {
        let outcome = self.engine.start(tx, kind, StartOptions::default()).await?;
        info!(instance_id = %outcome.instance_id, %kind, "Started workflow");
        Ok(self.handle(outcome.instance_id))
    }

    /// Start an instance that runs immediately in this process.
    pub async fn start_eager(&self, tx: Transaction, kind: WorkflowKind) -> Result<WorkflowHandle> {
        let outcome = self.engine.start(tx, kind, StartOptions::eager()).await?;
        info!(instance_id = %outcome.instance_id, %kind, "Started workflow eagerly");
        Ok(self.handle(outcome.instance_id))
    }

    /// Start an instance and wait for the phase-1 outcome only.
    ///
    /// Returns as soon as the init step has finished; phase 2 keeps running
    /// and its result is available from the handle.
    pub async fn start_with_update(
        &self,
        tx: Transaction,
        kind: WorkflowKind,
    ) -> Result<(WorkflowHandle, UpdateResult)> {
        self.start_with_policy(tx, kind, IdConflictPolicy::Reject).await
    }

    /// Like [`start_with_update`](Self::start_with_update), with an explicit
    /// policy for an id that is already in use.
    pub async fn start_with_policy(
        &self,
        tx: Transaction,
        kind: WorkflowKind,
        conflict: IdConflictPolicy,
    ) -> Result<(WorkflowHandle, UpdateResult)> {
        let options = StartOptions {
            conflict,
            ..StartOptions::with_update(UPDATE_NAME)
        };
        let outcome = self.engine.start(tx, kind, options).await?;
        let handle = self.handle(outcome.instance_id);
        info!(
            instance_id = %handle.id(),
            %kind,
            created = outcome.created,
            "Started workflow with update",
        );

        let reply = outcome
            .update
            .ok_or_else(|| FlowError::internal("start did not return an update reply"))?;
        let result = timeout(self.rpc_timeout, reply)
            .await
            .map_err(|_| FlowError::timeout("update_with_start", self.rpc_timeout))?
            .map_err(|_| FlowError::InstanceClosed {
                instance_id: handle.id().to_string(),
            })??;

        if let Err(e) = &result {
            warn!(
                instance_id = %handle.id(),
                error = %e,
                "transaction rejected, instance will cancel it",
            );
        }
        Ok((handle, result))
    }

    /// Handle to an existing instance.
    pub fn handle(&self, instance_id: impl Into<String>) -> WorkflowHandle {
        WorkflowHandle {
            engine: Arc::clone(&self.engine),
            instance_id: instance_id.into(),
            rpc_timeout: self.rpc_timeout,
        }
    }

    /// Run one of the latency scenarios end to end and time it.
    pub async fn run_scenario(
        &self,
        scenario: Scenario,
        tx: Transaction,
    ) -> Result<ExecutionReport> {
        let tx = tx.with_id(format!("{}{}", scenario.id_prefix(), tx.id));
        let started = Instant::now();

        let (handle, update_result) = match scenario {
            Scenario::LocalActivities => (self.start(tx, scenario.kind()).await?, None),
            Scenario::Eager => (self.start_eager(tx, scenario.kind()).await?, None),
            Scenario::UpdateWithStartLocal | Scenario::RegularActivities => {
                let (handle, result) = self.start_with_update(tx, scenario.kind()).await?;
                (handle, Some(result))
            }
        };
        let first_response = update_result.as_ref().map(|_| started.elapsed());

        let final_result = handle.wait_final().await?;
        let completion = started.elapsed();
        let first_response = first_response.unwrap_or(completion);
        let description = handle.describe().await?;

        info!(instance_id = %handle.id(), "Time to first response {:?}", first_response);
        info!(instance_id = %handle.id(), "Time to workflow completion {:?}", completion);

        Ok(ExecutionReport::new(
            scenario,
            handle.id(),
            first_response,
            completion,
            update_result,
            final_result,
            description.phase,
        ))
    }
}

/// Handle to one instance.
#[derive(Clone)]
pub struct WorkflowHandle {
    engine: Arc<Engine>,
    instance_id: String,
    rpc_timeout: Duration,
}

impl WorkflowHandle {
    pub fn id(&self) -> &str {
        &self.instance_id
    }

    /// Phase-1 outcome, via the early-return update.
    pub async fn init_result(&self) -> Result<UpdateResult> {
        timeout(self.rpc_timeout, self.engine.update(&self.instance_id, UPDATE_NAME))
            .await
            .map_err(|_| FlowError::timeout("init_result", self.rpc_timeout))?
    }

    pub async fn wait_final(&self) -> Result<FinalResult> {
        self.engine.wait_final(&self.instance_id).await
    }

    pub async fn describe(&self) -> Result<InstanceDescription> {
        self.engine.describe(&self.instance_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{
        register_all, ActivityError, ActivityRegistry, TransactionLatencies, TransactionLedger,
        COMPLETE_TRANSACTION,
    };
    use crate::core::config::FlowConfig;
    use crate::orchestration::Phase;
    use crate::transaction::{FailureClass, TxResult};
    use crate::worker::{WorkerHandle, WorkerOptions, WorkerPool};
    use pretty_assertions::assert_eq;

    async fn client() -> (Client, WorkerHandle, Arc<TransactionLedger>) {
        let registry = ActivityRegistry::new();
        let ledger = TransactionLedger::new();
        register_all(&registry, Arc::clone(&ledger), &TransactionLatencies::zero()).unwrap();
        let engine = Engine::open(FlowConfig::development(), registry).unwrap();
        let options = WorkerOptions::from_config(engine.config());
        let worker = WorkerPool::new(Arc::clone(&engine), options)
            .start()
            .await
            .unwrap();
        (Client::new(engine, ConnectionOptions::default()), worker, ledger)
    }

    #[tokio::test]
    async fn test_eager_scenario_report() {
        let (client, worker, _) = client().await;
        let tx = Transaction::new("abc", "Bob", "Alice", 100);

        let report = client.run_scenario(Scenario::Eager, tx).await.unwrap();
        assert_eq!(report.instance_id, "eager-latency-optimization-workflow-ID-abc");
        assert_eq!(report.status, Phase::Completed);
        assert!(report.update_result.is_none());
        assert_eq!(report.update_latency_ms, report.final_latency_ms);
        worker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_with_update_returns_before_completion() {
        let (client, worker, _) = client().await;
        let tx = Transaction::new("t1", "Bob", "Alice", 100);

        let (handle, result) = client
            .start_with_update(tx, WorkflowKind::UpdateWithStartLocal)
            .await
            .unwrap();
        assert_eq!(result, Ok(TxResult::initialized("t1")));
        assert_eq!(handle.wait_final().await.unwrap(), Ok(TxResult::completed("t1")));
        // Later updates see the recorded phase-1 outcome or a closed instance.
        assert!(matches!(
            handle.init_result().await,
            Err(FlowError::InstanceClosed { .. })
        ));
        worker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_use_existing_does_not_start_second_run() {
        let (client, worker, ledger) = client().await;
        let tx = Transaction::new("same", "Bob", "Alice", 100);

        let handle = client
            .start_eager(tx.clone(), WorkflowKind::LocalActivities)
            .await
            .unwrap();
        handle.wait_final().await.unwrap().unwrap();

        let err = client
            .start_with_update(tx.clone(), WorkflowKind::LocalActivities)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, FlowError::InstanceAlreadyExists { .. }));

        let err = client
            .start_with_policy(tx, WorkflowKind::LocalActivities, IdConflictPolicy::UseExisting)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, FlowError::InstanceClosed { .. }));
        assert_eq!(ledger.count(COMPLETE_TRANSACTION, "same"), 1);
        worker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_transaction_returns_early_error() {
        let (client, worker, ledger) = client().await;
        let tx = Transaction::new("t2", "Bob", "Alice", 0);

        let (handle, result) = client
            .start_with_update(tx, WorkflowKind::LocalActivities)
            .await
            .unwrap();
        let err = result.unwrap_err();
        assert_eq!(err, ActivityError::rejected("InitTransaction", "invalid Amount: 0"));

        let final_err = handle.wait_final().await.unwrap().unwrap_err();
        assert_eq!(final_err.cause(), &err);
        assert_eq!(final_err.classification(), FailureClass::BusinessRejection);
        assert_eq!(ledger.count(COMPLETE_TRANSACTION, "t2"), 0);
        worker.stop().await.unwrap();
    }
}
