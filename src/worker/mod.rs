//! Worker pool: polls the remote activity queue and the workflow task queue.

pub mod recovery;

pub use recovery::{Recovery, RecoveryStats};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::core::config::FlowConfig;
use crate::core::errors::{FlowError, Result};
use crate::orchestration::Engine;
use crate::queue::TaskQueue;

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Queue whose remote activity tasks this pool executes
    pub task_queue: String,
    pub max_concurrent_activities: usize,
    pub max_concurrent_workflows: usize,
    /// Longest a poll blocks before re-checking for shutdown
    pub poll_interval: Duration,
    /// Run recovery before polling
    pub recover_on_start: bool,
}

impl WorkerOptions {
    pub fn from_config(config: &FlowConfig) -> Self {
        Self {
            task_queue: config.task_queue.clone(),
            max_concurrent_activities: config.max_concurrent_activities,
            max_concurrent_workflows: config.max_concurrent_workflows,
            poll_interval: config.poll_interval,
            recover_on_start: true,
        }
    }
}

pub struct WorkerPool {
    engine: Arc<Engine>,
    options: WorkerOptions,
}

impl WorkerPool {
    pub fn new(engine: Arc<Engine>, options: WorkerOptions) -> Self {
        Self { engine, options }
    }

    /// Recover leftover work, then start polling until the handle is stopped.
    pub async fn start(self) -> Result<WorkerHandle> {
        if self.options.max_concurrent_activities == 0
            || self.options.max_concurrent_workflows == 0
        {
            return Err(FlowError::configuration_field(
                "worker concurrency must be greater than 0",
                "max_concurrent_activities",
            ));
        }

        let recovery = if self.options.recover_on_start {
            Recovery::new(Arc::clone(&self.engine)).recover().await?
        } else {
            RecoveryStats::default()
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue = self.engine.executor().queue(&self.options.task_queue);

        let activities = tokio::spawn(run_activity_loop(
            Arc::clone(&self.engine),
            queue,
            Arc::new(Semaphore::new(self.options.max_concurrent_activities)),
            self.options.poll_interval,
            shutdown_rx.clone(),
        ));
        let workflows = tokio::spawn(run_workflow_loop(
            Arc::clone(&self.engine),
            Arc::new(Semaphore::new(self.options.max_concurrent_workflows)),
            self.options.poll_interval,
            shutdown_rx,
        ));

        info!(
            task_queue = %self.options.task_queue,
            activities = self.options.max_concurrent_activities,
            workflows = self.options.max_concurrent_workflows,
            "worker pool started"
        );

        Ok(WorkerHandle {
            engine: self.engine,
            shutdown_tx,
            loops: vec![activities, workflows],
            recovery,
        })
    }
}

pub struct WorkerHandle {
    engine: Arc<Engine>,
    shutdown_tx: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
    recovery: RecoveryStats,
}

impl WorkerHandle {
    pub fn recovery(&self) -> &RecoveryStats {
        &self.recovery
    }

    /// Stop polling and flush the store. Tasks already taken run to completion
    /// in the background.
    pub async fn stop(self) -> Result<()> {
        self.shutdown_tx.send_replace(true);
        for handle in self.loops {
            if let Err(e) = handle.await {
                error!(error = %e, "worker loop panicked");
            }
        }
        self.engine.store().flush().await?;
        info!("worker pool stopped");
        Ok(())
    }
}

async fn run_activity_loop(
    engine: Arc<Engine>,
    queue: Arc<TaskQueue>,
    semaphore: Arc<Semaphore>,
    poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
) {
    while !*shutdown.borrow() {
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };

        let task = match queue.poll(poll_interval).await {
            Ok(Some(task)) => task,
            Ok(None) => continue,
            Err(e) => {
                error!(
                    queue = %queue.name(),
                    category = e.category(),
                    error = %e,
                    "activity poll failed",
                );
                sleep(poll_interval).await;
                continue;
            }
        };

        let engine = Arc::clone(&engine);
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            debug!(task_id = %task.task_id, activity = %task.activity, "executing activity task");
            let outcome = engine.executor().execute_task(&task).await;
            if let Err(e) = queue.complete(&task.task_id, outcome).await {
                error!(task_id = %task.task_id, error = %e, "failed to record task completion");
            }
            drop(permit);
        });
    }
    debug!(queue = %queue.name(), "activity loop stopped");
}

async fn run_workflow_loop(
    engine: Arc<Engine>,
    semaphore: Arc<Semaphore>,
    poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
) {
    while !*shutdown.borrow() {
        let Some(instance_id) = engine.next_workflow_task(poll_interval).await else {
            continue;
        };
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };

        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            if let Err(e) = engine.run_instance(&instance_id).await {
                error!(instance_id, category = e.category(), error = %e, "instance run failed");
            }
            drop(permit);
        });
    }
    debug!("workflow loop stopped");
}
