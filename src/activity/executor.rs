use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use super::{ActivityError, ActivityOptions, ActivityRegistry, ExecutionMode};
use crate::queue::TaskQueue;
use crate::storage::{ActivityTask, ActivityTaskStatus, HistoryStore};
use crate::transaction::Transaction;

/// One activity call issued by an orchestration instance.
#[derive(Debug, Clone)]
pub struct ActivityCall {
    pub instance_id: String,
    /// Position of this call in the instance's activity sequence
    pub seq: u32,
    pub name: String,
    pub transaction: Transaction,
}

/// Bookkeeping for one call, discarded when the call returns.
#[derive(Debug, Clone)]
pub struct ActivityInvocation {
    pub name: String,
    pub mode: ExecutionMode,
    pub timeout: Option<Duration>,
    pub attempts_made: u32,
}

/// Runs activities locally or through named task queues.
///
/// The executor holds no per-call state; queues are created on first use and
/// shared with the workers that drain them.
#[derive(Clone)]
pub struct ActivityExecutor {
    registry: ActivityRegistry,
    store: Arc<dyn HistoryStore>,
    queues: Arc<DashMap<String, Arc<TaskQueue>>>,
    queue_capacity: usize,
}

impl ActivityExecutor {
    pub fn new(
        registry: ActivityRegistry,
        store: Arc<dyn HistoryStore>,
        queue_capacity: usize,
    ) -> Self {
        Self {
            registry,
            store,
            queues: Arc::new(DashMap::new()),
            queue_capacity,
        }
    }

    pub fn registry(&self) -> &ActivityRegistry {
        &self.registry
    }

    /// The queue called `name`, created on first use.
    pub fn queue(&self, name: &str) -> Arc<TaskQueue> {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(TaskQueue::new(
                    name,
                    Arc::clone(&self.store),
                    self.queue_capacity,
                ))
            })
            .clone()
    }

    /// Run `call` under `options`, retrying inside the schedule-to-close envelope.
    pub async fn execute(
        &self,
        call: &ActivityCall,
        options: &ActivityOptions,
    ) -> Result<(), ActivityError> {
        let deadline = options.schedule_to_close.map(|d| Instant::now() + d);
        let mut invocation = ActivityInvocation {
            name: call.name.clone(),
            mode: options.mode.clone(),
            timeout: options.schedule_to_close.or(options.start_to_close),
            attempts_made: 0,
        };

        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if remaining == Some(Duration::ZERO) {
                return Err(ActivityError::timeout(
                    &call.name,
                    options.schedule_to_close.unwrap_or_default(),
                ));
            }
            let attempt_timeout = match (options.start_to_close, remaining) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };

            invocation.attempts_made += 1;
            let attempt = invocation.attempts_made;
            let result = match &options.mode {
                ExecutionMode::Local => self.run_local(call, attempt_timeout).await,
                ExecutionMode::Remote { queue } => {
                    self.run_remote(call, queue, attempt, attempt_timeout).await
                }
            };

            let err = match result {
                Ok(()) => {
                    debug!(
                        instance_id = %call.instance_id,
                        activity = %invocation.name,
                        mode = invocation.mode.label(),
                        attempts = invocation.attempts_made,
                        "activity succeeded"
                    );
                    return Ok(());
                }
                Err(err) => err,
            };

            if !err.is_retryable(&options.retry) || !options.retry.allows_attempt(attempt + 1) {
                return Err(err);
            }
            let backoff = options.retry.backoff(attempt);
            if let Some(deadline) = deadline {
                if Instant::now() + backoff >= deadline {
                    return Err(err);
                }
            }
            warn!(
                instance_id = %call.instance_id,
                activity = %invocation.name,
                attempt,
                error = %err,
                "activity attempt failed, retrying in {:?}",
                backoff
            );
            sleep(backoff).await;
        }
    }

    async fn run_local(
        &self,
        call: &ActivityCall,
        budget: Option<Duration>,
    ) -> Result<(), ActivityError> {
        self.run_registered(&call.name, &call.transaction, budget).await
    }

    async fn run_remote(
        &self,
        call: &ActivityCall,
        queue_name: &str,
        attempt: u32,
        budget: Option<Duration>,
    ) -> Result<(), ActivityError> {
        let now = Utc::now();
        let mut task = ActivityTask {
            task_id: ActivityTask::task_id_for(&call.instance_id, call.seq, attempt),
            instance_id: call.instance_id.clone(),
            seq: call.seq,
            attempt,
            activity: call.name.clone(),
            queue: queue_name.to_string(),
            transaction: call.transaction.clone(),
            timeout: budget,
            deadline: None,
            status: ActivityTaskStatus::Pending,
            result: None,
            enqueued_at: now,
            updated_at: now,
        };
        task.refresh_deadline(now);
        let task_id = task.task_id.clone();

        let queue = self.queue(queue_name);
        let outcome = queue
            .dispatch(task)
            .await
            .map_err(|e| e.into_activity_error(&call.name))?;

        let received = match budget {
            Some(budget) => match timeout(budget, outcome).await {
                Ok(received) => received,
                Err(_) => {
                    let err = ActivityError::timeout(&call.name, budget);
                    if let Err(e) = queue.abandon(&task_id, Err(err.clone())).await {
                        warn!(task_id, error = %e, "failed to abandon timed out task");
                    }
                    return Err(err);
                }
            },
            None => outcome.await,
        };
        received.map_err(|_| {
            ActivityError::unavailable(&call.name, "task queue dropped the result")
        })?
    }

    /// Execute a task taken from a queue; used by workers.
    ///
    /// The run is bounded by whatever is left of the task's deadline.
    pub async fn execute_task(&self, task: &ActivityTask) -> Result<(), ActivityError> {
        let budget = task.remaining(Utc::now()).or(task.timeout);
        if budget == Some(Duration::ZERO) {
            return Err(ActivityError::timeout(
                &task.activity,
                task.timeout.unwrap_or_default(),
            ));
        }
        self.run_registered(&task.activity, &task.transaction, budget)
            .await
    }

    async fn run_registered(
        &self,
        name: &str,
        transaction: &Transaction,
        budget: Option<Duration>,
    ) -> Result<(), ActivityError> {
        let activity = self
            .registry
            .get(name)
            .ok_or_else(|| ActivityError::execution_failed(name, "activity not registered"))?;

        match budget {
            Some(budget) => timeout(budget, activity.execute(transaction))
                .await
                .map_err(|_| ActivityError::timeout(name, budget))?,
            None => activity.execute(transaction).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{
        register_all, RetryPolicy, TransactionLatencies, TransactionLedger, INIT_TRANSACTION,
    };
    use crate::storage::SledStore;

    fn executor(latencies: TransactionLatencies) -> (ActivityExecutor, Arc<TransactionLedger>) {
        let registry = ActivityRegistry::new();
        let ledger = TransactionLedger::new();
        register_all(&registry, Arc::clone(&ledger), &latencies).unwrap();
        let store: Arc<dyn HistoryStore> = Arc::new(SledStore::temporary().unwrap());
        (ActivityExecutor::new(registry, store, 16), ledger)
    }

    fn call(amount: i64) -> ActivityCall {
        ActivityCall {
            instance_id: "t1".to_string(),
            seq: 2,
            name: INIT_TRANSACTION.to_string(),
            transaction: Transaction::new("t1", "Bob", "Alice", amount),
        }
    }

    #[tokio::test]
    async fn test_local_success_and_rejection() {
        let (executor, ledger) = executor(TransactionLatencies::zero());
        let options = ActivityOptions::local().schedule_to_close(Duration::from_secs(1));

        executor.execute(&call(100), &options).await.unwrap();

        let err = executor.execute(&call(0), &options).await.unwrap_err();
        assert!(err.is_validation());
        // Rejections are never retried: one success plus one rejection.
        assert_eq!(ledger.count(INIT_TRANSACTION, "t1"), 2);
    }

    #[tokio::test]
    async fn test_envelope_timeout() {
        let latencies = TransactionLatencies {
            init: Duration::from_millis(500),
            ..TransactionLatencies::zero()
        };
        let (executor, _) = executor(latencies);
        let options = ActivityOptions::local().schedule_to_close(Duration::from_millis(50));

        let started = Instant::now();
        let err = executor.execute(&call(100), &options).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let (executor, ledger) = executor(TransactionLatencies::zero());
        ledger.inject_failure(
            INIT_TRANSACTION,
            ActivityError::unavailable(INIT_TRANSACTION, "connection reset"),
        );
        let options = ActivityOptions::local()
            .schedule_to_close(Duration::from_secs(2))
            .retry(RetryPolicy {
                max_attempts: 3,
                initial_interval: Duration::from_millis(5),
                maximum_interval: Duration::from_millis(10),
                ..RetryPolicy::default()
            });

        let err = executor.execute(&call(100), &options).await.unwrap_err();
        assert!(matches!(err, ActivityError::Unavailable { .. }));
        assert_eq!(ledger.count(INIT_TRANSACTION, "t1"), 3);
    }

    #[tokio::test]
    async fn test_remote_round_trip() {
        let (executor, ledger) = executor(TransactionLatencies::zero());
        let options = ActivityOptions::remote("tq").schedule_to_close(Duration::from_secs(2));

        let worker = executor.clone();
        let serve = tokio::spawn(async move {
            let queue = worker.queue("tq");
            let task = queue.poll(Duration::from_secs(1)).await.unwrap().unwrap();
            let outcome = worker.execute_task(&task).await;
            queue.complete(&task.task_id, outcome).await.unwrap();
        });

        executor.execute(&call(100), &options).await.unwrap();
        serve.await.unwrap();
        assert_eq!(ledger.count(INIT_TRANSACTION, "t1"), 1);
    }

    #[tokio::test]
    async fn test_remote_without_worker_times_out() {
        let (executor, _) = executor(TransactionLatencies::zero());
        let options = ActivityOptions::remote("tq")
            .schedule_to_close(Duration::from_millis(50))
            .retry(RetryPolicy::no_retry());

        let err = executor.execute(&call(100), &options).await.unwrap_err();
        assert!(err.is_timeout());

        // The abandoned task is settled as timed out and never handed to a worker.
        let queue = executor.queue("tq");
        assert_eq!(queue.waiting(), 0);
        let stored = executor.store.get_task("t1:2:1").await.unwrap().unwrap();
        assert_eq!(stored.status, ActivityTaskStatus::Completed);
        assert!(matches!(stored.result, Some(Err(ActivityError::Timeout { .. }))));
        assert!(queue.poll(Duration::from_millis(20)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_task_is_not_executed() {
        let (executor, ledger) = executor(TransactionLatencies::zero());
        let mut task = ActivityTask {
            task_id: ActivityTask::task_id_for("t1", 2, 1),
            instance_id: "t1".to_string(),
            seq: 2,
            attempt: 1,
            activity: INIT_TRANSACTION.to_string(),
            queue: "tq".to_string(),
            transaction: Transaction::new("t1", "Bob", "Alice", 100),
            timeout: Some(Duration::from_millis(50)),
            deadline: None,
            status: ActivityTaskStatus::Running,
            result: None,
            enqueued_at: Utc::now(),
            updated_at: Utc::now(),
        };
        task.refresh_deadline(Utc::now() - chrono::Duration::seconds(1));

        let err = executor.execute_task(&task).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(ledger.count(INIT_TRANSACTION, "t1"), 0);
    }
}
