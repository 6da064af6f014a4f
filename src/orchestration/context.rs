//! Per-instance execution context: activity sequencing, history and replay.
//!
//! Every activity call an instance makes gets the next sequence number. If the
//! instance's history already holds a result for that number the recorded
//! result is returned and the activity is not run again. History writes are
//! best-effort: a failed write is logged and the instance keeps going.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::metrics::EngineMetrics;
use super::workflow::Phase;
use crate::activity::{ActivityCall, ActivityError, ActivityExecutor, ActivityOptions};
use crate::storage::{HistoryEvent, HistoryStore, InstanceRecord};
use crate::transaction::{Transaction, TransactionError, TxResult};

pub struct OrchestrationContext {
    record: InstanceRecord,
    store: Arc<dyn HistoryStore>,
    executor: ActivityExecutor,
    metrics: Arc<EngineMetrics>,
    phase_tx: watch::Sender<Phase>,
    next_seq: u32,
    replay: HashMap<u32, (String, Result<(), ActivityError>)>,
    recorded_phases: HashSet<Phase>,
}

impl OrchestrationContext {
    pub fn new(
        record: InstanceRecord,
        history: &[HistoryEvent],
        store: Arc<dyn HistoryStore>,
        executor: ActivityExecutor,
        metrics: Arc<EngineMetrics>,
        phase_tx: watch::Sender<Phase>,
    ) -> Self {
        let mut replay = HashMap::new();
        let mut recorded_phases = HashSet::new();
        for event in history {
            match event {
                HistoryEvent::ActivityCompleted { seq, name, result } => {
                    replay.insert(*seq, (name.clone(), result.clone()));
                }
                HistoryEvent::PhaseChanged { phase } => {
                    recorded_phases.insert(*phase);
                }
                HistoryEvent::InstanceStarted { .. } | HistoryEvent::ActivityScheduled { .. } => {}
            }
        }
        if !replay.is_empty() {
            debug!(
                instance_id = %record.instance_id,
                recorded = replay.len(),
                "replaying instance history",
            );
        }

        // Replay re-walks the state machine from the start.
        let mut record = record;
        record.phase = Phase::Created;

        Self {
            record,
            store,
            executor,
            metrics,
            phase_tx,
            next_seq: 0,
            replay,
            recorded_phases,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.record.instance_id
    }

    pub fn transaction(&self) -> &Transaction {
        &self.record.transaction
    }

    pub fn phase(&self) -> Phase {
        self.record.phase
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// Whether the next call to `name` will be answered from history.
    pub fn will_replay(&self, name: &str) -> bool {
        self.replay
            .get(&(self.next_seq + 1))
            .is_some_and(|(recorded, _)| recorded == name)
    }

    /// Run the next activity in sequence, or return its recorded result.
    pub async fn execute_activity(
        &mut self,
        name: &str,
        options: &ActivityOptions,
    ) -> Result<(), ActivityError> {
        self.next_seq += 1;
        let seq = self.next_seq;

        if let Some((recorded_name, result)) = self.replay.remove(&seq) {
            if recorded_name == name {
                debug!(
                    instance_id = %self.record.instance_id,
                    seq,
                    activity = name,
                    "activity result replayed",
                );
                self.metrics.record_replayed_activity();
                return result;
            }
            // History diverged from the code path; stop trusting it.
            warn!(
                instance_id = %self.record.instance_id,
                seq,
                expected = %recorded_name,
                actual = name,
                "history mismatch, discarding remaining replay state"
            );
            self.replay.clear();
        }

        self.append(HistoryEvent::ActivityScheduled {
            seq,
            name: name.to_string(),
            mode: options.mode.clone(),
        })
        .await;

        let call = ActivityCall {
            instance_id: self.record.instance_id.clone(),
            seq,
            name: name.to_string(),
            transaction: self.record.transaction.clone(),
        };
        let result = self.executor.execute(&call, options).await;

        self.append(HistoryEvent::ActivityCompleted {
            seq,
            name: name.to_string(),
            result: result.clone(),
        })
        .await;
        result
    }

    /// Move to `next`, publishing and persisting the new phase.
    pub async fn transition(&mut self, next: Phase) {
        let current = self.record.phase;
        debug_assert!(
            current.can_transition_to(next),
            "illegal transition {current:?} -> {next:?}"
        );
        if !current.can_transition_to(next) {
            warn!(
                instance_id = %self.record.instance_id,
                ?current,
                ?next,
                "illegal phase transition",
            );
        }

        self.record.phase = next;
        self.record.updated_at = Utc::now();
        self.phase_tx.send_replace(next);

        if self.recorded_phases.remove(&next) {
            debug!(instance_id = %self.record.instance_id, phase = ?next, "phase replayed");
            return;
        }
        info!(
            instance_id = %self.record.instance_id,
            from = ?current,
            to = ?next,
            "phase transition",
        );
        self.append(HistoryEvent::PhaseChanged { phase: next }).await;
        self.persist().await;
    }

    pub async fn record_init_outcome(&mut self, outcome: &Result<(), ActivityError>) {
        self.record.init_result = Some(outcome.clone());
        self.persist().await;
    }

    /// Store the terminal result and return the final record.
    pub async fn finish(mut self, result: &Result<TxResult, TransactionError>) -> InstanceRecord {
        self.record.final_result = Some(result.clone());
        self.record.updated_at = Utc::now();
        self.persist().await;
        if let Err(e) = self.store.flush().await {
            warn!(
                instance_id = %self.record.instance_id,
                error = %e,
                "failed to flush final instance state",
            );
        }
        self.record
    }

    async fn append(&self, event: HistoryEvent) {
        if let Err(e) = self.store.append_event(&self.record.instance_id, &event).await {
            warn!(
                instance_id = %self.record.instance_id,
                error = %e,
                "failed to append history event",
            );
        }
    }

    async fn persist(&self) {
        if let Err(e) = self.store.put_instance(&self.record).await {
            warn!(
                instance_id = %self.record.instance_id,
                error = %e,
                "failed to persist instance record",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{
        register_all, ActivityRegistry, TransactionLatencies, TransactionLedger, INIT_TRANSACTION,
        REGISTER_TRANSACTION_ID,
    };
    use crate::orchestration::workflow::WorkflowKind;
    use crate::storage::SledStore;

    fn setup() -> (Arc<dyn HistoryStore>, ActivityExecutor, Arc<TransactionLedger>) {
        let registry = ActivityRegistry::new();
        let ledger = TransactionLedger::new();
        register_all(&registry, Arc::clone(&ledger), &TransactionLatencies::zero()).unwrap();
        let store: Arc<dyn HistoryStore> = Arc::new(SledStore::temporary().unwrap());
        let executor = ActivityExecutor::new(registry, Arc::clone(&store), 16);
        (store, executor, ledger)
    }

    fn context(
        store: &Arc<dyn HistoryStore>,
        executor: &ActivityExecutor,
        history: &[HistoryEvent],
    ) -> (OrchestrationContext, Arc<EngineMetrics>) {
        let record = InstanceRecord::new(
            Transaction::new("t1", "Bob", "Alice", 100),
            WorkflowKind::LocalActivities,
        );
        let metrics = Arc::new(EngineMetrics::new());
        let (phase_tx, _) = watch::channel(Phase::Created);
        let ctx = OrchestrationContext::new(
            record,
            history,
            Arc::clone(store),
            executor.clone(),
            Arc::clone(&metrics),
            phase_tx,
        );
        (ctx, metrics)
    }

    #[tokio::test]
    async fn test_recorded_results_are_not_rerun() {
        let (store, executor, ledger) = setup();
        let options = ActivityOptions::local();

        let (mut first, _) = context(&store, &executor, &[]);
        first.execute_activity(REGISTER_TRANSACTION_ID, &options).await.unwrap();
        first.execute_activity(INIT_TRANSACTION, &options).await.unwrap();
        assert_eq!(ledger.count(INIT_TRANSACTION, "t1"), 1);

        let history = store.load_history("t1").await.unwrap();
        let (mut replayed, metrics) = context(&store, &executor, &history);
        assert!(replayed.will_replay(REGISTER_TRANSACTION_ID));
        assert!(!replayed.will_replay(INIT_TRANSACTION));
        replayed.execute_activity(REGISTER_TRANSACTION_ID, &options).await.unwrap();
        assert!(replayed.will_replay(INIT_TRANSACTION));
        replayed.execute_activity(INIT_TRANSACTION, &options).await.unwrap();

        assert_eq!(ledger.count(INIT_TRANSACTION, "t1"), 1);
        assert_eq!(metrics.snapshot().activities_replayed, 2);
    }

    #[tokio::test]
    async fn test_mismatched_history_is_discarded() {
        let (store, executor, ledger) = setup();
        let history = vec![HistoryEvent::ActivityCompleted {
            seq: 1,
            name: "SomethingElse".to_string(),
            result: Ok(()),
        }];
        let (mut ctx, _) = context(&store, &executor, &history);
        ctx.execute_activity(REGISTER_TRANSACTION_ID, &ActivityOptions::local())
            .await
            .unwrap();
        assert!(ledger.is_registered("t1"));
    }

    #[tokio::test]
    async fn test_transition_publishes_phase() {
        let (store, executor, _) = setup();
        let record = InstanceRecord::new(
            Transaction::new("t1", "Bob", "Alice", 100),
            WorkflowKind::LocalActivities,
        );
        store.create_instance(&record).await.unwrap();

        let (phase_tx, phase_rx) = watch::channel(Phase::Created);
        let mut ctx = OrchestrationContext::new(
            record,
            &[],
            Arc::clone(&store),
            executor,
            Arc::new(EngineMetrics::new()),
            phase_tx,
        );
        ctx.transition(Phase::Registering).await;

        assert_eq!(*phase_rx.borrow(), Phase::Registering);
        let stored = store.get_instance("t1").await.unwrap().unwrap();
        assert_eq!(stored.phase, Phase::Registering);
    }
}
