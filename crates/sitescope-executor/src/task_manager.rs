//! Task and module state management.
//!
//! Every mutation runs in its own write transaction whose first statement
//! takes the task's row lock, so concurrent writers of one task serialize and
//! each sees the other's committed slice. After commit, a [`TaskEvent`] is
//! broadcast.

use crate::error::{ExecutorError, Result};
use crate::events::TaskEvent;
use chrono::Utc;
use sitescope_core::{
    CrawlFragment, Module, NewTask, ResultSlice, RunStatus, Task, TaskId, TaskResults,
};
use sitescope_db::{modules, tasks, DatabaseError};
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Persisted task state plus the event stream describing its changes.
pub struct TaskManager {
    pool: SqlitePool,
    events: broadcast::Sender<TaskEvent>,
}

impl TaskManager {
    /// Create a manager over `pool` whose event channel buffers
    /// `event_buffer` events per subscriber.
    #[must_use]
    pub fn new(pool: SqlitePool, event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Self { pool, events }
    }

    /// Subscribe to every event published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: TaskEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Persist a new pending task with one pending module per name.
    pub async fn create_task(&self, request: &NewTask, module_names: &[String]) -> Result<Task> {
        request.validate()?;
        if module_names.is_empty() {
            return Err(ExecutorError::Validation(
                "a task needs at least one module".to_string(),
            ));
        }

        let now = Utc::now();
        let task = Task {
            id: TaskId::generate(),
            target_url: request.target_url.clone(),
            options: request.options.clone(),
            language: request.language.clone(),
            ai_mode: request.ai_mode,
            user_id: request.user_id.clone(),
            is_public: request.is_public,
            status: RunStatus::Pending,
            results: TaskResults::default(),
            modules: module_names
                .iter()
                .map(|name| (name.clone(), Module::pending(name.as_str())))
                .collect(),
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };

        let mut tx = self.pool.begin().await?;
        tasks::insert_task(&mut tx, &task).await?;
        tx.commit().await?;

        info!(
            task_id = %task.id,
            target_url = %task.target_url,
            modules = module_names.len(),
            "Task created"
        );
        self.emit(TaskEvent::TaskStatusChanged {
            task_id: task.id.clone(),
            status: RunStatus::Pending,
            error: None,
        });

        Ok(task)
    }

    /// Load a task with its modules.
    ///
    /// # Errors
    /// Returns `ExecutorError::TaskNotFound` if it does not exist.
    pub async fn get_task(&self, task_id: &TaskId) -> Result<Task> {
        tasks::get_task(&self.pool, task_id)
            .await?
            .ok_or_else(|| ExecutorError::TaskNotFound(task_id.clone()))
    }

    /// Move the task to `status`, stamping `started_at` on start and
    /// `completed_at` on a terminal status. `error` replaces the task error
    /// when given.
    ///
    /// # Errors
    /// Returns `ExecutorError::InvalidTransition` if the state machine forbids
    /// the move; terminal tasks never change.
    pub async fn update_status(
        &self,
        task_id: &TaskId,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<Task> {
        let mut tx = self.pool.begin().await?;
        let mut task = lock_and_fetch(&mut tx, task_id).await?;

        task.status = task.status.transition_to(status)?;
        let now = Utc::now();
        if status == RunStatus::Running {
            task.started_at = Some(now);
        }
        if status.is_terminal() {
            task.completed_at = Some(now);
        }
        if error.is_some() {
            task.error_message.clone_from(&error);
        }
        tasks::touch(&mut task);
        tasks::save_task(&mut tx, &task).await?;
        tx.commit().await?;

        info!(task_id = %task_id, status = %status, "Task status changed");
        self.emit(TaskEvent::TaskStatusChanged {
            task_id: task_id.clone(),
            status,
            error,
        });

        Ok(task)
    }

    /// Move one module to `status` with an optional error or warning.
    ///
    /// # Errors
    /// - `ExecutorError::TaskTerminal` once the task is terminal
    /// - `ExecutorError::InvalidTransition` for a forbidden module move
    pub async fn update_module_status(
        &self,
        task_id: &TaskId,
        name: &str,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<Module> {
        let mut tx = self.pool.begin().await?;
        let task_status = lock_status(&mut tx, task_id).await?;
        if task_status.is_terminal() {
            return Err(ExecutorError::TaskTerminal(task_id.clone(), task_status));
        }

        let mut module = modules::fetch_module(&mut tx, task_id, name).await?;
        module.status = module.status.transition_to(status)?;
        let now = Utc::now();
        if status == RunStatus::Running {
            module.started_at = Some(now);
        }
        if status.is_terminal() {
            module.completed_at = Some(now);
        }
        module.error.clone_from(&error);
        modules::update_module(&mut tx, task_id, &module).await?;
        tx.commit().await?;

        debug!(task_id = %task_id, module = name, status = %status, "Module status changed");
        self.emit(TaskEvent::ModuleStatusChanged {
            task_id: task_id.clone(),
            module: name.to_string(),
            status,
            error,
        });

        Ok(module)
    }

    /// Record advisory progress. Counters left `None` keep their stored
    /// value; progress for a terminal module or task is dropped.
    pub async fn update_module_progress(
        &self,
        task_id: &TaskId,
        name: &str,
        current: Option<u64>,
        total: Option<u64>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let task_status = lock_status(&mut tx, task_id).await?;
        let mut module = modules::fetch_module(&mut tx, task_id, name).await?;
        if task_status.is_terminal() || module.status.is_terminal() {
            debug!(task_id = %task_id, module = name, "Dropping progress for finished module");
            return Ok(());
        }

        if current.is_some() {
            module.progress.current = current;
        }
        if total.is_some() {
            module.progress.total = total;
        }
        let progress = module.progress;
        modules::update_module(&mut tx, task_id, &module).await?;
        tx.commit().await?;

        self.emit(TaskEvent::ModuleProgress {
            task_id: task_id.clone(),
            module: name.to_string(),
            progress,
        });
        Ok(())
    }

    /// Overwrite the result field(s) owned by `slice`, preserving every
    /// other field written so far.
    ///
    /// # Errors
    /// Returns `ExecutorError::TaskTerminal` once the task is terminal.
    pub async fn merge_partial_results(
        &self,
        task_id: &TaskId,
        module: &str,
        slice: ResultSlice,
    ) -> Result<()> {
        let fields: Vec<String> = slice.fields().iter().map(|f| (*f).to_string()).collect();

        let mut tx = self.pool.begin().await?;
        let mut task = lock_and_fetch(&mut tx, task_id).await?;
        if task.is_terminal() {
            return Err(ExecutorError::TaskTerminal(task_id.clone(), task.status));
        }
        task.results.apply(slice);
        tasks::touch(&mut task);
        tasks::save_task(&mut tx, &task).await?;
        tx.commit().await?;

        debug!(task_id = %task_id, module, fields = ?fields, "Partial result merged");
        self.emit(TaskEvent::PartialResult {
            task_id: task_id.clone(),
            module: module.to_string(),
            fields,
        });
        Ok(())
    }

    /// Append streamed crawl pages to the crawl result and roll them into
    /// the link summary.
    ///
    /// # Errors
    /// Returns `ExecutorError::TaskTerminal` once the task is terminal.
    pub async fn append_streaming_fragment(
        &self,
        task_id: &TaskId,
        fragment: &CrawlFragment,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let mut task = lock_and_fetch(&mut tx, task_id).await?;
        if task.is_terminal() {
            return Err(ExecutorError::TaskTerminal(task_id.clone(), task.status));
        }
        task.results.append_fragment(fragment);
        let total_urls = task.results.crawl.as_ref().map_or(0, |c| c.urls.len());
        tasks::touch(&mut task);
        tasks::save_task(&mut tx, &task).await?;
        tx.commit().await?;

        self.emit(TaskEvent::FragmentAppended {
            task_id: task_id.clone(),
            pages: fragment.pages.len(),
            total_urls,
        });
        Ok(())
    }

    /// Modules of a task, sorted by name.
    pub async fn list_modules(&self, task_id: &TaskId) -> Result<Vec<Module>> {
        let mut conn = self.pool.acquire().await?;
        let modules = modules::fetch_modules(&mut conn, task_id).await?;
        drop(conn);

        if modules.is_empty() && tasks::get_task(&self.pool, task_id).await?.is_none() {
            return Err(ExecutorError::TaskNotFound(task_id.clone()));
        }

        let mut modules: Vec<Module> = modules.into_values().collect();
        modules.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(modules)
    }

    /// Wait until every named module of the task is terminal.
    ///
    /// Persisted statuses are re-checked whenever a module status event for
    /// the task arrives (and after a lagged receiver), never on a timer.
    /// Returns `false` if `wait` elapsed or `cancel` fired first. Names the
    /// task does not have count as terminal.
    pub async fn wait_for_modules(
        &self,
        task_id: &TaskId,
        names: &[String],
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        // Subscribe before the first check so no change slips in between.
        let mut events = self.subscribe();
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            if self.modules_terminal(task_id, names).await? {
                return Ok(true);
            }

            let woke = tokio::select! {
                () = cancel.cancelled() => false,
                () = tokio::time::sleep_until(deadline) => false,
                changed = next_module_change(&mut events, task_id) => changed,
            };
            if !woke {
                debug!(task_id = %task_id, "Stopped waiting for modules");
                return Ok(false);
            }
        }
    }

    async fn modules_terminal(&self, task_id: &TaskId, names: &[String]) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        let modules = modules::fetch_modules(&mut conn, task_id).await?;
        Ok(all_terminal(&modules, names))
    }

    /// Delete a task and its modules. Returns `false` if it did not exist.
    pub async fn delete_task(&self, task_id: &TaskId) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        let deleted = tasks::delete_task(&mut conn, task_id).await?;
        if deleted {
            info!(task_id = %task_id, "Task deleted");
        }
        Ok(deleted)
    }
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("subscribers", &self.events.receiver_count())
            .finish_non_exhaustive()
    }
}

fn all_terminal(modules: &HashMap<String, Module>, names: &[String]) -> bool {
    names
        .iter()
        .filter_map(|name| modules.get(name))
        .all(|m| m.status.is_terminal())
}

/// Resolves `true` on the next module status change of `task_id` (or a lag,
/// after which the caller must re-check), `false` if the channel closed.
async fn next_module_change(
    events: &mut broadcast::Receiver<TaskEvent>,
    task_id: &TaskId,
) -> bool {
    loop {
        match events.recv().await {
            Ok(event) if event.is_module_status_of(task_id) => return true,
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "Event receiver lagged");
                return true;
            }
            Err(RecvError::Closed) => return false,
        }
    }
}

async fn lock_and_fetch(conn: &mut SqliteConnection, task_id: &TaskId) -> Result<Task> {
    tasks::lock_task(conn, task_id)
        .await
        .map_err(|e| not_found_or(e, task_id))?;
    Ok(tasks::fetch_task(conn, task_id).await?)
}

async fn lock_status(conn: &mut SqliteConnection, task_id: &TaskId) -> Result<RunStatus> {
    tasks::lock_task(conn, task_id)
        .await
        .map_err(|e| not_found_or(e, task_id))?;
    let status: String = sqlx::query_scalar("SELECT status FROM tasks WHERE id = ?")
        .bind(task_id.as_str())
        .fetch_one(&mut *conn)
        .await?;
    Ok(status.parse()?)
}

fn not_found_or(err: DatabaseError, task_id: &TaskId) -> ExecutorError {
    match err {
        DatabaseError::NotFoundWithMessage(_) => ExecutorError::TaskNotFound(task_id.clone()),
        other => other.into(),
    }
}
