use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::errors::Result;
use crate::orchestration::Engine;
use crate::storage::{ActivityTask, ActivityTaskStatus};

/// Counts from one recovery pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Tasks found `Running`, i.e. interrupted mid-execution
    pub interrupted: usize,
    /// Tasks put back on their queue
    pub requeued: usize,
    /// Tasks that could not be re-enqueued
    pub failed: usize,
    /// Non-terminal instances resumed from history
    pub instances_resumed: usize,
}

/// Brings persisted work back after a restart or crash.
pub struct Recovery {
    engine: Arc<Engine>,
}

impl Recovery {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Recover tasks and instances left over from a previous run
    ///
    /// 1. Tasks still marked `Running` are reset to `Pending`
    /// 2. Every `Pending` task gets a fresh deadline and is pushed back onto its queue
    /// 3. Instances that never reached a terminal phase are replayed
    ///
    /// Resumed instances that re-dispatch a recovered task attach to it
    /// instead of creating a second one.
    pub async fn recover(&self) -> Result<RecoveryStats> {
        info!("Starting recovery");
        let store = self.engine.store();
        let mut stats = RecoveryStats::default();

        for mut task in store.list_tasks(ActivityTaskStatus::Running).await? {
            stats.interrupted += 1;
            task.status = ActivityTaskStatus::Pending;
            store.put_task(&task).await?;
            info!(task_id = %task.task_id, "reset interrupted task to Pending");
        }

        // Whoever waited on these died with the old process; resumed
        // instances wait again on a full budget.
        let now = Utc::now();
        let mut pending = store.list_tasks(ActivityTaskStatus::Pending).await?;
        for task in &mut pending {
            task.refresh_deadline(now);
            task.updated_at = now;
            store.put_task(task).await?;
        }
        store.flush().await?;

        for task in pending {
            if self.requeue(&task) {
                stats.requeued += 1;
            } else {
                stats.failed += 1;
            }
        }

        stats.instances_resumed = self.engine.recover().await?;

        info!(
            "Recovery completed: {} requeued ({} interrupted), {} failed, {} instances resumed",
            stats.requeued, stats.interrupted, stats.failed, stats.instances_resumed
        );
        Ok(stats)
    }

    fn requeue(&self, task: &ActivityTask) -> bool {
        let queue = self.engine.executor().queue(&task.queue);
        match queue.requeue(task.task_id.clone()) {
            Ok(()) => true,
            Err(e) => {
                // Stays Pending in the store; the next recovery pass retries it.
                warn!(task_id = %task.task_id, error = %e, "failed to requeue task");
                false
            }
        }
    }
}
