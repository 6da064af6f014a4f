//! Embedded orchestration backend.
//!
//! The engine owns instance identity (one instance per transaction id,
//! enforced by a compare-and-swap in the store), the per-instance update
//! channel, the workflow task queue polled by workers and the replay of
//! persisted instances after a restart.
//!
//! Each running instance is driven by a single tokio task. That task
//! multiplexes the main flow with any number of update handlers, so only one
//! of them makes progress at a time and control only changes hands at
//! `.await` points.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::context::OrchestrationContext;
use super::gate::InitGate;
use super::metrics::{EngineMetrics, MetricsSnapshot};
use super::workflow::{Phase, TransactionWorkflow, WorkflowKind};
use crate::activity::{ActivityError, ActivityExecutor, ActivityRegistry};
use crate::core::config::{FlowConfig, UPDATE_NAME};
use crate::core::errors::{FlowError, Result};
use crate::queue::ReadyQueue;
use crate::storage::{HistoryEvent, HistoryStore, InstanceRecord, SledStore};
use crate::transaction::{Transaction, TransactionError, TxResult};

/// Result of the update handler: the phase-1 outcome.
pub type UpdateResult = std::result::Result<TxResult, ActivityError>;
/// Terminal result of an instance.
pub type FinalResult = std::result::Result<TxResult, TransactionError>;

/// What `start` does when the transaction id is already taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdConflictPolicy {
    /// Fail with [`FlowError::InstanceAlreadyExists`]
    #[default]
    Reject,
    /// Attach to the existing instance without starting a second run
    UseExisting,
}

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Run the instance on the calling process instead of queueing it
    pub eager: bool,
    pub conflict: IdConflictPolicy,
    /// Update to deliver together with the start request
    pub update: Option<String>,
}

impl StartOptions {
    pub fn with_update(name: impl Into<String>) -> Self {
        Self {
            update: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn eager() -> Self {
        Self {
            eager: true,
            ..Self::default()
        }
    }
}

pub struct StartOutcome {
    pub instance_id: String,
    /// False when an existing instance was reused
    pub created: bool,
    /// Reply to the update sent with the start request, if any
    pub update: Option<oneshot::Receiver<Result<UpdateResult>>>,
}

/// Point-in-time view of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescription {
    pub instance_id: String,
    pub kind: WorkflowKind,
    pub phase: Phase,
    pub init_result: Option<std::result::Result<(), ActivityError>>,
    pub final_result: Option<FinalResult>,
    /// Whether this process is driving the instance
    pub live: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

struct UpdateRequest {
    name: String,
    reply: oneshot::Sender<Result<UpdateResult>>,
}

struct InstanceSlot {
    update_tx: mpsc::UnboundedSender<UpdateRequest>,
    phase_rx: watch::Receiver<Phase>,
    final_rx: watch::Receiver<Option<FinalResult>>,
}

/// Everything needed to run an instance, claimed by exactly one runner.
struct PendingRun {
    record: InstanceRecord,
    history: Vec<HistoryEvent>,
    update_rx: mpsc::UnboundedReceiver<UpdateRequest>,
    phase_tx: watch::Sender<Phase>,
    final_tx: watch::Sender<Option<FinalResult>>,
}

pub struct Engine {
    config: Arc<FlowConfig>,
    store: Arc<dyn HistoryStore>,
    executor: ActivityExecutor,
    instances: DashMap<String, Arc<InstanceSlot>>,
    pending: DashMap<String, PendingRun>,
    workflow_queue: ReadyQueue<String>,
    metrics: Arc<EngineMetrics>,
}

impl Engine {
    pub fn new(
        config: FlowConfig,
        store: Arc<dyn HistoryStore>,
        registry: ActivityRegistry,
    ) -> Result<Arc<Self>> {
        config.validate().map_err(FlowError::configuration)?;
        let executor = ActivityExecutor::new(registry, Arc::clone(&store), config.queue_capacity);
        Ok(Arc::new(Self {
            workflow_queue: ReadyQueue::new(config.queue_capacity),
            config: Arc::new(config),
            store,
            executor,
            instances: DashMap::new(),
            pending: DashMap::new(),
            metrics: Arc::new(EngineMetrics::new()),
        }))
    }

    /// Engine over the sled database at `config.db_path`, or a temporary one.
    pub fn open(config: FlowConfig, registry: ActivityRegistry) -> Result<Arc<Self>> {
        let store: Arc<dyn HistoryStore> = match &config.db_path {
            Some(path) => Arc::new(SledStore::open(path)?),
            None => Arc::new(SledStore::temporary()?),
        };
        Self::new(config, store, registry)
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    pub fn executor(&self) -> &ActivityExecutor {
        &self.executor
    }

    pub fn store(&self) -> &Arc<dyn HistoryStore> {
        &self.store
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Create an instance for `tx` and schedule it.
    ///
    /// With `options.update` set, the update is queued on the new instance
    /// before the instance can be polled, so it is always observed.
    pub async fn start(
        self: &Arc<Self>,
        tx: Transaction,
        kind: WorkflowKind,
        options: StartOptions,
    ) -> Result<StartOutcome> {
        if tx.id.trim().is_empty() {
            return Err(FlowError::invalid_request("transaction id must not be empty"));
        }
        let instance_id = tx.id.clone();
        let record = InstanceRecord::new(tx.clone(), kind);

        // Nothing is persisted for a start the queue cannot take.
        if !options.eager && self.workflow_queue.is_full() {
            warn!(instance_id, "workflow queue full, start refused");
            return Err(FlowError::QueueFull {
                queue: "workflow".to_string(),
                capacity: self.workflow_queue.capacity(),
            });
        }

        if !self.store.create_instance(&record).await? {
            return match options.conflict {
                IdConflictPolicy::Reject => {
                    warn!(instance_id, "rejected duplicate start");
                    Err(FlowError::InstanceAlreadyExists { instance_id })
                }
                IdConflictPolicy::UseExisting => {
                    debug!(instance_id, "start attached to existing instance");
                    let update = match options.update {
                        Some(name) => Some(self.send_update(&instance_id, name).await?),
                        None => None,
                    };
                    Ok(StartOutcome {
                        instance_id,
                        created: false,
                        update,
                    })
                }
            };
        }

        self.metrics.record_started();
        self.store
            .append_event(
                &instance_id,
                &HistoryEvent::InstanceStarted {
                    kind,
                    transaction: tx,
                    at: record.created_at,
                },
            )
            .await?;
        self.store.flush().await?;

        let slot = self.install(record, Vec::new());
        let update = options
            .update
            .map(|name| Self::enqueue_update(&slot, &instance_id, name))
            .transpose()?;

        info!(instance_id, %kind, eager = options.eager, "instance started");
        if options.eager {
            self.spawn_instance(instance_id.clone());
        } else if let Err(instance_id) = self.workflow_queue.push(instance_id.clone()) {
            // Filled up since the check above; the instance already exists, so run it here.
            warn!(instance_id, "workflow queue filled during start, running instance locally");
            self.spawn_instance(instance_id);
        }

        Ok(StartOutcome {
            instance_id,
            created: true,
            update,
        })
    }

    fn install(&self, record: InstanceRecord, history: Vec<HistoryEvent>) -> Arc<InstanceSlot> {
        let instance_id = record.instance_id.clone();
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(record.phase);
        let (final_tx, final_rx) = watch::channel(None);

        let slot = Arc::new(InstanceSlot {
            update_tx,
            phase_rx,
            final_rx,
        });
        self.pending.insert(
            instance_id.clone(),
            PendingRun {
                record,
                history,
                update_rx,
                phase_tx,
                final_tx,
            },
        );
        self.instances.insert(instance_id, Arc::clone(&slot));
        slot
    }

    fn enqueue_update(
        slot: &InstanceSlot,
        instance_id: &str,
        name: String,
    ) -> Result<oneshot::Receiver<Result<UpdateResult>>> {
        let (reply, rx) = oneshot::channel();
        slot.update_tx
            .send(UpdateRequest { name, reply })
            .map_err(|_| FlowError::InstanceClosed {
                instance_id: instance_id.to_string(),
            })?;
        Ok(rx)
    }

    async fn send_update(
        &self,
        instance_id: &str,
        name: String,
    ) -> Result<oneshot::Receiver<Result<UpdateResult>>> {
        let slot = self.instances.get(instance_id).map(|s| Arc::clone(s.value()));
        match slot {
            Some(slot) => Self::enqueue_update(&slot, instance_id, name),
            None => Err(self.missing_instance_error(instance_id).await),
        }
    }

    async fn missing_instance_error(&self, instance_id: &str) -> FlowError {
        let instance_id = instance_id.to_string();
        match self.store.get_instance(&instance_id).await {
            Ok(Some(record)) if record.is_terminal() => FlowError::InstanceClosed { instance_id },
            Ok(Some(_)) => FlowError::InstanceNotRunning { instance_id },
            Ok(None) => FlowError::InstanceNotFound { instance_id },
            Err(e) => e,
        }
    }

    /// Invoke the update handler `name` on a running instance.
    pub async fn update(&self, instance_id: &str, name: &str) -> Result<UpdateResult> {
        let rx = self.send_update(instance_id, name.to_string()).await?;
        rx.await.map_err(|_| FlowError::InstanceClosed {
            instance_id: instance_id.to_string(),
        })?
    }

    /// Wait until the instance is terminal and return its result.
    pub async fn wait_final(&self, instance_id: &str) -> Result<FinalResult> {
        let slot = self.instances.get(instance_id).map(|s| Arc::clone(s.value()));
        if let Some(slot) = slot {
            let mut rx = slot.final_rx.clone();
            let value = rx
                .wait_for(Option::is_some)
                .await
                .map_err(|_| FlowError::channel("final_result", "instance runner stopped"))?;
            return value
                .clone()
                .ok_or_else(|| FlowError::internal("final result vanished"));
        }

        match self.store.get_instance(instance_id).await? {
            Some(InstanceRecord {
                final_result: Some(result),
                ..
            }) => Ok(result),
            Some(_) => Err(FlowError::InstanceNotRunning {
                instance_id: instance_id.to_string(),
            }),
            None => Err(FlowError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            }),
        }
    }

    pub async fn describe(&self, instance_id: &str) -> Result<InstanceDescription> {
        let record = self
            .store
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| FlowError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })?;
        let slot = self.instances.get(instance_id).map(|s| Arc::clone(s.value()));
        let (phase, live) = match &slot {
            Some(slot) => {
                let phase = *slot.phase_rx.borrow();
                (phase, !phase.is_terminal())
            }
            None => (record.phase, false),
        };

        Ok(InstanceDescription {
            instance_id: record.instance_id,
            kind: record.kind,
            phase,
            init_result: record.init_result,
            final_result: record.final_result,
            live,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }

    /// Number of instances this process is currently driving or holding for a worker.
    pub fn live_instances(&self) -> usize {
        self.instances.len()
    }

    /// Pop the next queued instance id, waiting up to `max_wait`.
    pub async fn next_workflow_task(&self, max_wait: Duration) -> Option<String> {
        self.workflow_queue.pop_timeout(max_wait).await
    }

    pub fn spawn_instance(self: &Arc<Self>, instance_id: String) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = engine.run_instance(&instance_id).await {
                error!(instance_id, category = e.category(), error = %e, "instance run failed");
            }
        })
    }

    /// Resume every persisted instance that has not reached a terminal phase.
    pub async fn recover(self: &Arc<Self>) -> Result<usize> {
        let mut resumed = 0;
        for record in self.store.list_open_instances().await? {
            if self.instances.contains_key(&record.instance_id) {
                continue;
            }
            let instance_id = record.instance_id.clone();
            let history = self.store.load_history(&instance_id).await?;
            info!(instance_id, phase = ?record.phase, events = history.len(), "resuming instance");
            self.install(record, history);
            self.metrics.record_recovered();
            self.spawn_instance(instance_id);
            resumed += 1;
        }
        Ok(resumed)
    }

    /// Drive one instance to completion. A second call for the same id is a no-op.
    pub async fn run_instance(&self, instance_id: &str) -> Result<()> {
        let Some((_, run)) = self.pending.remove(instance_id) else {
            debug!(instance_id, "instance already claimed");
            return Ok(());
        };
        let PendingRun {
            record,
            history,
            mut update_rx,
            phase_tx,
            final_tx,
        } = run;

        let workflow = TransactionWorkflow::new(record.kind, &self.config);
        let gate = InitGate::new();
        let mut ctx = OrchestrationContext::new(
            record,
            &history,
            Arc::clone(&self.store),
            self.executor.clone(),
            Arc::clone(&self.metrics),
            phase_tx,
        );

        let mut handlers = FuturesUnordered::new();
        let result = {
            let main = workflow.run(&mut ctx, &gate);
            tokio::pin!(main);
            loop {
                tokio::select! {
                    biased;
                    Some(request) = update_rx.recv() => {
                        handlers.push(serve_update(request, &gate, instance_id));
                    }
                    Some(()) = handlers.next(), if !handlers.is_empty() => {}
                    result = &mut main => break result,
                }
            }
        };

        // Updates already queued still get an answer; later ones see a closed instance.
        update_rx.close();
        while let Some(request) = update_rx.recv().await {
            handlers.push(serve_update(request, &gate, instance_id));
        }
        while handlers.next().await.is_some() {}

        let record = ctx.finish(&result).await;
        match record.phase {
            Phase::Completed => self.metrics.record_completed(),
            Phase::Cancelled => self.metrics.record_cancelled(),
            Phase::Failed => self.metrics.record_failed(),
            other => warn!(instance_id, phase = ?other, "instance finished in non-terminal phase"),
        }
        match &result {
            Ok(_) => info!(instance_id, phase = ?record.phase, "instance finished"),
            Err(e) => info!(
                instance_id,
                phase = ?record.phase,
                error = %e,
                "instance finished with error",
            ),
        }
        // Late callers read the persisted record from here on.
        self.instances.remove(instance_id);
        final_tx.send_replace(Some(result));
        Ok(())
    }
}

async fn serve_update(request: UpdateRequest, gate: &InitGate, instance_id: &str) {
    let reply = if request.name == UPDATE_NAME {
        Ok(gate
            .await_ready()
            .await
            .map(|()| TxResult::initialized(instance_id)))
    } else {
        Err(FlowError::UnknownUpdate {
            instance_id: instance_id.to_string(),
            name: request.name,
        })
    };
    // The caller may have stopped waiting.
    let _ = request.reply.send(reply);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{
        register_all, TransactionLatencies, TransactionLedger, COMPLETE_TRANSACTION,
    };
    use pretty_assertions::assert_eq;

    fn engine() -> (Arc<Engine>, Arc<TransactionLedger>) {
        let registry = ActivityRegistry::new();
        let ledger = TransactionLedger::new();
        register_all(&registry, Arc::clone(&ledger), &TransactionLatencies::zero()).unwrap();
        let engine = Engine::open(FlowConfig::development(), registry).unwrap();
        (engine, ledger)
    }

    #[tokio::test]
    async fn test_eager_local_instance_completes() {
        let (engine, ledger) = engine();
        let tx = Transaction::new("t1", "Bob", "Alice", 100);

        let outcome = engine
            .start(
                tx,
                WorkflowKind::LocalActivities,
                StartOptions {
                    eager: true,
                    update: Some(UPDATE_NAME.to_string()),
                    ..StartOptions::default()
                },
            )
            .await
            .unwrap();
        assert!(outcome.created);

        let update = outcome.update.unwrap().await.unwrap().unwrap();
        assert_eq!(update, Ok(TxResult::initialized("t1")));

        let result = engine.wait_final("t1").await.unwrap();
        assert_eq!(result, Ok(TxResult::completed("t1")));
        assert_eq!(ledger.count(COMPLETE_TRANSACTION, "t1"), 1);

        let description = engine.describe("t1").await.unwrap();
        assert_eq!(description.phase, Phase::Completed);
        assert!(!description.live);
        assert_eq!(engine.metrics().instances_completed, 1);
    }

    #[tokio::test]
    async fn test_duplicate_start_rejected() {
        let (engine, _) = engine();
        let tx = Transaction::new("dup", "Bob", "Alice", 100);
        engine
            .start(tx.clone(), WorkflowKind::LocalActivities, StartOptions::eager())
            .await
            .unwrap();

        let err = engine
            .start(tx, WorkflowKind::LocalActivities, StartOptions::eager())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, FlowError::InstanceAlreadyExists { .. }));
        assert_eq!(engine.metrics().instances_started, 1);
    }

    #[tokio::test]
    async fn test_unknown_update_and_closed_instance() {
        let (engine, _) = engine();
        let tx = Transaction::new("t1", "Bob", "Alice", 100);
        engine
            .start(tx, WorkflowKind::LocalActivities, StartOptions::eager())
            .await
            .unwrap();

        let err = engine.update("t1", "no-such-update").await.unwrap_err();
        assert!(matches!(err, FlowError::UnknownUpdate { .. }));

        engine.wait_final("t1").await.unwrap().unwrap();
        let err = engine.update("t1", UPDATE_NAME).await.unwrap_err();
        assert!(matches!(err, FlowError::InstanceClosed { .. }));

        let err = engine.update("missing", UPDATE_NAME).await.unwrap_err();
        assert!(matches!(err, FlowError::InstanceNotFound { .. }));
    }

    #[tokio::test]
    async fn test_queued_instance_runs_when_polled() {
        let (engine, _) = engine();
        let tx = Transaction::new("queued", "Bob", "Alice", 100);
        engine
            .start(tx, WorkflowKind::LocalActivities, StartOptions::default())
            .await
            .unwrap();
        assert_eq!(engine.describe("queued").await.unwrap().phase, Phase::Created);

        let id = engine.next_workflow_task(Duration::from_secs(1)).await.unwrap();
        assert_eq!(id, "queued");
        engine.run_instance(&id).await.unwrap();
        // Claimed once; a second run is a no-op.
        engine.run_instance(&id).await.unwrap();

        let result = engine.wait_final("queued").await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_full_workflow_queue_leaves_no_instance_behind() {
        let registry = ActivityRegistry::new();
        register_all(&registry, TransactionLedger::new(), &TransactionLatencies::zero()).unwrap();
        let config = FlowConfig {
            queue_capacity: 1,
            ..FlowConfig::development()
        };
        let engine = Engine::open(config, registry).unwrap();

        let first = Transaction::new("a", "Bob", "Alice", 100);
        let second = Transaction::new("b", "Bob", "Alice", 100);
        engine
            .start(first, WorkflowKind::LocalActivities, StartOptions::default())
            .await
            .unwrap();
        let err = engine
            .start(second.clone(), WorkflowKind::LocalActivities, StartOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, FlowError::QueueFull { .. }));
        assert!(matches!(
            engine.describe("b").await.unwrap_err(),
            FlowError::InstanceNotFound { .. }
        ));
        assert_eq!(engine.recover().await.unwrap(), 0);

        let id = engine.next_workflow_task(Duration::from_secs(1)).await.unwrap();
        engine.run_instance(&id).await.unwrap();

        // Once there is room the same id starts normally.
        engine
            .start(second, WorkflowKind::LocalActivities, StartOptions::default())
            .await
            .unwrap();
        let id = engine.next_workflow_task(Duration::from_secs(1)).await.unwrap();
        assert_eq!(id, "b");
        engine.run_instance(&id).await.unwrap();
        assert_eq!(
            engine.wait_final("b").await.unwrap(),
            Ok(TxResult::completed("b"))
        );
        assert_eq!(engine.metrics().instances_started, 2);
    }

    #[tokio::test]
    async fn test_finished_instances_are_released() {
        let (engine, _) = engine();
        for id in ["r1", "r2", "r3"] {
            let tx = Transaction::new(id, "Bob", "Alice", 100);
            engine
                .start(tx, WorkflowKind::LocalActivities, StartOptions::eager())
                .await
                .unwrap();
        }

        for id in ["r1", "r2", "r3"] {
            assert_eq!(engine.wait_final(id).await.unwrap(), Ok(TxResult::completed(id)));
        }
        assert_eq!(engine.live_instances(), 0);

        // Released instances still answer from the store.
        let description = engine.describe("r2").await.unwrap();
        assert_eq!(description.phase, Phase::Completed);
        assert!(!description.live);
        assert_eq!(engine.wait_final("r2").await.unwrap(), Ok(TxResult::completed("r2")));
        assert!(matches!(
            engine.update("r2", UPDATE_NAME).await.unwrap_err(),
            FlowError::InstanceClosed { .. }
        ));
    }
}
