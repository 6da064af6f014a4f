use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::ReadyQueue;
use crate::activity::ActivityError;
use crate::core::errors::{FlowError, Result};
use crate::storage::{ActivityTask, ActivityTaskStatus, HistoryStore};

pub type TaskOutcome = std::result::Result<(), ActivityError>;

/// A named, durable queue of remote activity tasks.
///
/// Every task is written to the store and flushed before it becomes visible
/// to workers, so a dispatch survives a crash of the dispatching process.
/// Completion is persisted before any waiter is woken.
pub struct TaskQueue {
    name: String,
    store: Arc<dyn HistoryStore>,
    ready: ReadyQueue<String>,
    waiters: DashMap<String, Vec<oneshot::Sender<TaskOutcome>>>,
}

impl TaskQueue {
    pub fn new(name: impl Into<String>, store: Arc<dyn HistoryStore>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            store,
            ready: ReadyQueue::new(capacity),
            waiters: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of task ids waiting to be polled.
    pub fn backlog(&self) -> usize {
        self.ready.len()
    }

    /// Number of tasks someone is still waiting on.
    pub fn waiting(&self) -> usize {
        self.waiters.len()
    }

    /// Record `task` and return a receiver for its outcome.
    ///
    /// If a task with the same id already exists the call attaches to it
    /// instead of enqueueing a duplicate; a completed task resolves at once.
    pub async fn dispatch(&self, task: ActivityTask) -> Result<oneshot::Receiver<TaskOutcome>> {
        let task_id = task.task_id.clone();
        let rx = self.subscribe(&task_id);

        if let Some(mut existing) = self.store.get_task(&task_id).await? {
            debug!(
                queue = %self.name,
                task_id,
                status = ?existing.status,
                "re-attached to existing task",
            );
            if existing.status == ActivityTaskStatus::Completed {
                let outcome = existing.result.unwrap_or(Ok(()));
                self.resolve(&task_id, outcome);
            } else {
                // The new dispatcher waits on its own budget.
                existing.deadline = task.deadline;
                existing.updated_at = Utc::now();
                self.store.put_task(&existing).await?;
            }
            return Ok(rx);
        }

        if self.ready.is_full() {
            self.waiters.remove(&task_id);
            return Err(FlowError::QueueFull {
                queue: self.name.clone(),
                capacity: self.ready.capacity(),
            });
        }

        self.store.put_task(&task).await?;
        self.store.flush().await?;

        if self.ready.push(task_id.clone()).is_err() {
            self.waiters.remove(&task_id);
            return Err(FlowError::QueueFull {
                queue: self.name.clone(),
                capacity: self.ready.capacity(),
            });
        }
        debug!(queue = %self.name, task_id, activity = %task.activity, "task dispatched");
        Ok(rx)
    }

    fn subscribe(&self, task_id: &str) -> oneshot::Receiver<TaskOutcome> {
        let (tx, rx) = oneshot::channel();
        let mut senders = self.waiters.entry(task_id.to_string()).or_default();
        senders.retain(|s| !s.is_closed());
        senders.push(tx);
        rx
    }

    fn resolve(&self, task_id: &str, outcome: TaskOutcome) {
        if let Some((_, senders)) = self.waiters.remove(task_id) {
            for sender in senders {
                // The dispatcher may have given up on this attempt.
                let _ = sender.send(outcome.clone());
            }
        }
    }

    /// Take the next runnable task, marking it `Running`.
    pub async fn poll(&self, max_wait: Duration) -> Result<Option<ActivityTask>> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let Some(task_id) = self.ready.pop_timeout(remaining).await else {
                return Ok(None);
            };

            let Some(mut task) = self.store.get_task(&task_id).await? else {
                warn!(queue = %self.name, task_id, "queued task missing from store");
                continue;
            };
            if task.status == ActivityTaskStatus::Completed {
                continue;
            }
            if task.is_expired(Utc::now()) {
                let timeout = task.timeout.unwrap_or_default();
                let expired = Err(ActivityError::timeout(&task.activity, timeout));
                debug!(queue = %self.name, task_id, "dropping task past its deadline");
                self.finish(task, expired).await?;
                continue;
            }

            task.status = ActivityTaskStatus::Running;
            task.updated_at = Utc::now();
            self.store.put_task(&task).await?;
            return Ok(Some(task));
        }
    }

    /// Persist the outcome of a task, then wake everyone waiting on it.
    ///
    /// The first recorded outcome wins; a late completion is ignored.
    pub async fn complete(&self, task_id: &str, outcome: TaskOutcome) -> Result<()> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| FlowError::internal(format!("completing unknown task {task_id}")))?;
        if task.status == ActivityTaskStatus::Completed {
            debug!(queue = %self.name, task_id, "task already settled, dropping late outcome");
            return Ok(());
        }
        self.finish(task, outcome).await
    }

    /// Called by a dispatcher that stopped waiting for `task_id`.
    ///
    /// A task no worker has taken yet is settled with `outcome` so it never
    /// runs. A running task is left to finish; only the dead waiters go.
    pub async fn abandon(&self, task_id: &str, outcome: TaskOutcome) -> Result<()> {
        match self.store.get_task(task_id).await? {
            Some(task) if task.status == ActivityTaskStatus::Pending => {
                debug!(queue = %self.name, task_id, "abandoned task will not run");
                self.finish(task, outcome).await
            }
            _ => {
                self.prune(task_id);
                Ok(())
            }
        }
    }

    async fn finish(&self, mut task: ActivityTask, outcome: TaskOutcome) -> Result<()> {
        task.status = ActivityTaskStatus::Completed;
        task.result = Some(outcome.clone());
        task.updated_at = Utc::now();
        self.store.put_task(&task).await?;
        self.store.flush().await?;

        debug!(queue = %self.name, task_id = %task.task_id, ok = outcome.is_ok(), "task completed");
        self.resolve(&task.task_id, outcome);
        Ok(())
    }

    fn prune(&self, task_id: &str) {
        self.waiters.remove_if_mut(task_id, |_, senders| {
            senders.retain(|s| !s.is_closed());
            senders.is_empty()
        });
    }

    /// Put an already-persisted task id back on the ready queue.
    pub fn requeue(&self, task_id: String) -> Result<()> {
        self.ready.push(task_id).map_err(|_| FlowError::QueueFull {
            queue: self.name.clone(),
            capacity: self.ready.capacity(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SledStore;
    use crate::transaction::Transaction;

    fn task(instance: &str, seq: u32) -> ActivityTask {
        let now = Utc::now();
        ActivityTask {
            task_id: ActivityTask::task_id_for(instance, seq, 1),
            instance_id: instance.to_string(),
            seq,
            attempt: 1,
            activity: "CompleteTransaction".to_string(),
            queue: "tq".to_string(),
            transaction: Transaction::new(instance, "Bob", "Alice", 100),
            timeout: None,
            deadline: None,
            status: ActivityTaskStatus::Pending,
            result: None,
            enqueued_at: now,
            updated_at: now,
        }
    }

    fn queue() -> (TaskQueue, Arc<dyn HistoryStore>) {
        let store: Arc<dyn HistoryStore> = Arc::new(SledStore::temporary().unwrap());
        (TaskQueue::new("tq", Arc::clone(&store), 8), store)
    }

    #[tokio::test]
    async fn test_dispatch_poll_complete() {
        let (queue, store) = queue();
        let rx = queue.dispatch(task("t1", 3)).await.unwrap();

        let polled = queue.poll(Duration::from_millis(100)).await.unwrap().unwrap();
        assert_eq!(polled.task_id, "t1:3:1");
        let stored = store.get_task("t1:3:1").await.unwrap().unwrap();
        assert_eq!(stored.status, ActivityTaskStatus::Running);

        queue.complete("t1:3:1", Ok(())).await.unwrap();
        assert_eq!(rx.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_redispatch_attaches_to_existing() {
        let (queue, _) = queue();
        let first = queue.dispatch(task("t1", 3)).await.unwrap();
        let second = queue.dispatch(task("t1", 3)).await.unwrap();
        assert_eq!(queue.backlog(), 1);

        let polled = queue.poll(Duration::from_millis(100)).await.unwrap().unwrap();
        let failure = Err(ActivityError::execution_failed("CompleteTransaction", "boom"));
        queue.complete(&polled.task_id, failure.clone()).await.unwrap();

        assert_eq!(first.await.unwrap(), failure);
        assert_eq!(second.await.unwrap(), failure);

        // A completed task resolves immediately without being queued again.
        let third = queue.dispatch(task("t1", 3)).await.unwrap();
        assert_eq!(third.await.unwrap(), failure);
        assert!(queue.poll(Duration::from_millis(20)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_abandoned_pending_task_never_runs() {
        let (queue, store) = queue();
        let rx = queue.dispatch(task("t1", 2)).await.unwrap();
        drop(rx);

        let timed_out = Err(ActivityError::timeout(
            "CompleteTransaction",
            Duration::from_millis(100),
        ));
        queue.abandon("t1:2:1", timed_out.clone()).await.unwrap();
        assert_eq!(queue.waiting(), 0);
        assert!(queue.poll(Duration::from_millis(20)).await.unwrap().is_none());

        // A worker that raced the abandon cannot overwrite the settled outcome.
        queue.complete("t1:2:1", Ok(())).await.unwrap();
        let stored = store.get_task("t1:2:1").await.unwrap().unwrap();
        assert_eq!(stored.status, ActivityTaskStatus::Completed);
        assert_eq!(stored.result, Some(timed_out));
    }

    #[tokio::test]
    async fn test_abandoning_running_task_only_drops_waiters() {
        let (queue, store) = queue();
        let rx = queue.dispatch(task("t1", 2)).await.unwrap();
        let polled = queue.poll(Duration::from_millis(100)).await.unwrap().unwrap();
        drop(rx);

        let timed_out = Err(ActivityError::timeout(
            "CompleteTransaction",
            Duration::from_millis(100),
        ));
        queue.abandon(&polled.task_id, timed_out).await.unwrap();
        assert_eq!(queue.waiting(), 0);
        let stored = store.get_task(&polled.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ActivityTaskStatus::Running);

        queue.complete(&polled.task_id, Ok(())).await.unwrap();
        let stored = store.get_task(&polled.task_id).await.unwrap().unwrap();
        assert_eq!(stored.result, Some(Ok(())));
    }

    #[tokio::test]
    async fn test_poll_skips_expired_task() {
        let (queue, store) = queue();
        let mut expired = task("t1", 2);
        expired.timeout = Some(Duration::from_millis(10));
        expired.refresh_deadline(Utc::now() - chrono::Duration::seconds(1));
        let rx = queue.dispatch(expired).await.unwrap();
        let _fresh = queue.dispatch(task("t2", 2)).await.unwrap();

        let polled = queue.poll(Duration::from_millis(100)).await.unwrap().unwrap();
        assert_eq!(polled.task_id, "t2:2:1");

        let outcome = rx.await.unwrap();
        assert!(matches!(outcome, Err(ActivityError::Timeout { .. })));
        let stored = store.get_task("t1:2:1").await.unwrap().unwrap();
        assert_eq!(stored.status, ActivityTaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_queue_full() {
        let store: Arc<dyn HistoryStore> = Arc::new(SledStore::temporary().unwrap());
        let queue = TaskQueue::new("tq", store, 1);
        let _first = queue.dispatch(task("t1", 1)).await.unwrap();
        let err = queue.dispatch(task("t2", 1)).await.unwrap_err();
        assert_eq!(err.category(), "queue");
    }
}
