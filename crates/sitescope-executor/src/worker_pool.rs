//! Fixed-size pool of task workers.

use crate::executor::Executor;
use sitescope_core::{Task, TaskId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Runs at most `size` tasks at a time, one tokio task per submission.
///
/// A submission that cannot get a slot within the acquire timeout fails its
/// task instead of queueing forever.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    executor: Arc<Executor>,
    semaphore: Arc<Semaphore>,
    size: usize,
    acquire_timeout: Duration,
}

impl WorkerPool {
    /// Create a pool of `size` workers (at least one).
    #[must_use]
    pub fn new(executor: Arc<Executor>, size: usize, acquire_timeout: Duration) -> Self {
        let size = size.max(1);
        info!(size, "Task worker pool created");
        Self {
            executor,
            semaphore: Arc::new(Semaphore::new(size)),
            size,
            acquire_timeout,
        }
    }

    /// Number of workers.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers currently idle.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Queue a task. The handle resolves to the task's final state, or `None`
    /// if it could not be persisted.
    pub fn submit(&self, task_id: TaskId) -> JoinHandle<Option<Task>> {
        let executor = self.executor.clone();
        let semaphore = self.semaphore.clone();
        let acquire_timeout = self.acquire_timeout;

        tokio::spawn(async move {
            let permit = match tokio::time::timeout(acquire_timeout, semaphore.acquire_owned()).await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(err)) => {
                    error!(task_id = %task_id, error = %err, "Worker pool closed");
                    return fail(&executor, &task_id, "worker pool is shut down").await;
                }
                Err(_) => {
                    warn!(task_id = %task_id, timeout = ?acquire_timeout, "No worker available");
                    let reason = format!(
                        "no worker available within {}s",
                        acquire_timeout.as_secs()
                    );
                    return fail(&executor, &task_id, &reason).await;
                }
            };

            let result = executor.execute(&task_id).await;
            drop(permit);

            match result {
                Ok(task) => Some(task),
                Err(e) => {
                    error!(task_id = %task_id, error = %e, "Task execution failed");
                    None
                }
            }
        })
    }

    /// Stop handing out slots; queued submissions fail.
    pub fn close(&self) {
        self.semaphore.close();
        warn!("Task worker pool closed");
    }
}

async fn fail(executor: &Executor, task_id: &TaskId, reason: &str) -> Option<Task> {
    match executor.abort(task_id, reason).await {
        Ok(task) => Some(task),
        Err(e) => {
            error!(task_id = %task_id, error = %e, "Failed to fail unscheduled task");
            None
        }
    }
}
