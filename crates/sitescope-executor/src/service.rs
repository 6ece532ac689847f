//! Task submission entry point.
//!
//! `TaskService` wires the registry, task manager, credit ledger, executor and
//! worker pool together and implements the submit flow:
//!
//! 1. validate the request and plan its phases
//! 2. reserve credits for paid features (the whole request is rejected if any
//!    feature is unaffordable)
//! 3. create the task and its modules, then link the reservation to it
//! 4. hand the task to the worker pool

use crate::error::{ExecutorError, Result};
use crate::events::TaskEvent;
use crate::executor::Executor;
use crate::plan::ExecutionPlan;
use crate::task_manager::TaskManager;
use crate::worker_pool::WorkerPool;
use sitescope_core::{AppConfig, LedgerConfig, NewTask, Task, TaskId};
use sitescope_db::Database;
use sitescope_ledger::{retry_with_backoff, CreditLedger, LedgerError, Reservation};
use sitescope_plugin::PluginRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// A task that was accepted and queued.
#[derive(Debug)]
pub struct SubmittedTask {
    /// The task as created (pending)
    pub task: Task,
    /// Resolves to the task's final state once a worker finished it
    pub handle: JoinHandle<Option<Task>>,
}

/// Accepts analysis requests and runs them in the background.
#[derive(Debug)]
pub struct TaskService {
    registry: PluginRegistry,
    tasks: Arc<TaskManager>,
    ledger: Arc<CreditLedger>,
    executor: Arc<Executor>,
    workers: WorkerPool,
    ledger_config: LedgerConfig,
}

impl TaskService {
    /// Build the service on an open (migrated) database.
    #[must_use]
    pub fn new(db: &Database, registry: PluginRegistry, config: &AppConfig) -> Self {
        let tasks = Arc::new(TaskManager::new(
            db.pool().clone(),
            config.executor.event_buffer,
        ));
        let ledger = Arc::new(CreditLedger::new(db.pool().clone()));
        let executor = Arc::new(Executor::new(
            registry.clone(),
            tasks.clone(),
            ledger.clone(),
            config.executor.clone(),
        ));
        let workers = WorkerPool::new(
            executor.clone(),
            config.executor.worker_pool_size,
            config.executor.worker_acquire_timeout(),
        );

        Self {
            registry,
            tasks,
            ledger,
            executor,
            workers,
            ledger_config: config.ledger.clone(),
        }
    }

    /// Task state and events.
    #[must_use]
    pub fn tasks(&self) -> &Arc<TaskManager> {
        &self.tasks
    }

    /// The credit ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<CreditLedger> {
        &self.ledger
    }

    /// The executor, for running a task in the caller's task.
    #[must_use]
    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// The worker pool.
    #[must_use]
    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    /// Subscribe to task events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tasks.subscribe()
    }

    /// Validate, reserve, create and queue a task.
    ///
    /// # Errors
    /// - `ExecutorError::Core` for an invalid request
    /// - `ExecutorError::Validation` when a needed plugin is not registered
    /// - `ExecutorError::Ledger` when credits cannot be reserved; no task is
    ///   created in that case
    pub async fn submit(&self, request: NewTask) -> Result<SubmittedTask> {
        request.validate()?;

        let plan = ExecutionPlan::from_options(&request.options);
        if let Some(missing) = plan
            .required_plugins()
            .into_iter()
            .find(|name| !self.registry.contains(name))
        {
            return Err(ExecutorError::Validation(format!(
                "plugin '{missing}' is not registered"
            )));
        }

        let features = plan.billable_features();
        let reservation = self.reserve(&request, &features).await?;

        let task = match self
            .tasks
            .create_task(&request, &plan.module_names())
            .await
        {
            Ok(task) => task,
            Err(e) => {
                error!(error = %e, "Failed to create task; releasing reservation");
                self.release(&reservation).await;
                return Err(e);
            }
        };

        if let Err(e) = self
            .ledger
            .link_records_to_task(&reservation, &task.id)
            .await
        {
            error!(task_id = %task.id, error = %e, "Failed to link reservation; dropping task");
            self.release(&reservation).await;
            if let Err(e) = self.tasks.delete_task(&task.id).await {
                error!(task_id = %task.id, error = %e, "Failed to delete unlinked task");
            }
            return Err(e.into());
        }

        info!(
            task_id = %task.id,
            reserved = reservation.total(),
            records = reservation.records.len(),
            "Task submitted"
        );
        let handle = self.workers.submit(task.id.clone());
        Ok(SubmittedTask { task, handle })
    }

    /// Submit a task and wait for its final state.
    pub async fn submit_and_wait(&self, request: NewTask) -> Result<Task> {
        let submitted = self.submit(request).await?;
        let task_id = submitted.task.id.clone();
        match submitted.handle.await {
            Ok(Some(task)) => Ok(task),
            Ok(None) => self.tasks.get_task(&task_id).await,
            Err(e) => Err(ExecutorError::WorkerStopped(format!("task {task_id}: {e}"))),
        }
    }

    /// Load a task.
    pub async fn get_task(&self, task_id: &TaskId) -> Result<Task> {
        self.tasks.get_task(task_id).await
    }

    /// Delete a task. Unsettled reservations of the task are discarded.
    pub async fn delete_task(&self, task_id: &TaskId) -> Result<bool> {
        self.ledger.delete_unsettled_records(task_id, None).await?;
        self.tasks.delete_task(task_id).await
    }

    async fn reserve(&self, request: &NewTask, features: &[String]) -> Result<Reservation> {
        let attempts = self.ledger_config.reservation_attempts;
        let backoff = Duration::from_millis(self.ledger_config.reservation_backoff_ms);
        let user = request.user_id.as_ref();

        let reservation = retry_with_backoff(
            || self.ledger.create_usage_records(user, features),
            attempts,
            backoff,
            LedgerError::is_conflict,
        )
        .await
        .inspect_err(|e| warn!(error = %e, "Credit reservation rejected"))?;
        Ok(reservation)
    }

    async fn release(&self, reservation: &Reservation) {
        if let Err(e) = self.ledger.discard_reservation(reservation).await {
            error!(error = %e, "Failed to release reservation");
        }
    }
}
