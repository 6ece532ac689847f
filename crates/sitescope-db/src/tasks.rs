//! Task persistence.
//!
//! A task row carries the request, the status and the JSON-encoded result
//! aggregate. Module rows live in `task_modules` (see [`crate::modules`]) and
//! are loaded together with the task.

use crate::error::{DatabaseError, Result};
use crate::modules;
use crate::{parse_optional_timestamp, parse_timestamp};
use chrono::Utc;
use sitescope_core::{AnalysisOption, Task, TaskId, TaskResults, UserId};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::BTreeSet;

const TASK_COLUMNS: &str = "id, target_url, options, language, ai_mode, user_id, is_public, \
     status, results, error_message, created_at, updated_at, started_at, completed_at";

/// Insert a new task together with its module rows.
///
/// # Errors
/// Returns an error if the insert fails (for example on a duplicate ID).
pub async fn insert_task(conn: &mut SqliteConnection, task: &Task) -> Result<()> {
    let options = serde_json::to_string(&task.options)?;
    let results = serde_json::to_string(&task.results)?;

    sqlx::query(
        "INSERT INTO tasks (id, target_url, options, language, ai_mode, user_id, is_public,
                            status, results, error_message, created_at, updated_at,
                            started_at, completed_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(task.id.as_str())
    .bind(&task.target_url)
    .bind(options)
    .bind(&task.language)
    .bind(task.ai_mode.as_str())
    .bind(task.user_id.as_ref().map(UserId::as_str))
    .bind(task.is_public)
    .bind(task.status.as_str())
    .bind(results)
    .bind(&task.error_message)
    .bind(task.created_at.to_rfc3339())
    .bind(task.updated_at.to_rfc3339())
    .bind(task.started_at.map(|t| t.to_rfc3339()))
    .bind(task.completed_at.map(|t| t.to_rfc3339()))
    .execute(&mut *conn)
    .await?;

    for module in task.modules.values() {
        modules::insert_module(conn, &task.id, module).await?;
    }

    Ok(())
}

/// Take the write lock for a task row inside the caller's transaction.
///
/// This must be the first statement of the transaction so that the read that
/// follows sees a row no other writer can change until commit.
///
/// # Errors
/// Returns `DatabaseError::NotFoundWithMessage` if the task does not exist.
pub async fn lock_task(conn: &mut SqliteConnection, id: &TaskId) -> Result<()> {
    let result = sqlx::query("UPDATE tasks SET updated_at = updated_at WHERE id = ?")
        .bind(id.as_str())
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(task_not_found(id));
    }
    Ok(())
}

/// Load a task and its modules.
///
/// # Errors
/// Returns `DatabaseError::NotFoundWithMessage` if the task does not exist.
pub async fn fetch_task(conn: &mut SqliteConnection, id: &TaskId) -> Result<Task> {
    let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
        .bind(id.as_str())
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| task_not_found(id))?;

    let mut task = task_from_row(&row)?;
    task.modules = modules::fetch_modules(conn, id).await?;
    Ok(task)
}

/// Load a task outside any transaction. Returns `None` if it does not exist.
pub async fn get_task(pool: &SqlitePool, id: &TaskId) -> Result<Option<Task>> {
    let mut conn = pool.acquire().await?;
    match fetch_task(&mut conn, id).await {
        Ok(task) => Ok(Some(task)),
        Err(DatabaseError::NotFoundWithMessage(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Write back the mutable task columns: status, results, error and timestamps.
///
/// Module rows are written separately through [`crate::modules::update_module`].
pub async fn save_task(conn: &mut SqliteConnection, task: &Task) -> Result<()> {
    let results = serde_json::to_string(&task.results)?;

    let result = sqlx::query(
        "UPDATE tasks
         SET status = ?, results = ?, error_message = ?, updated_at = ?,
             started_at = ?, completed_at = ?
         WHERE id = ?",
    )
    .bind(task.status.as_str())
    .bind(results)
    .bind(&task.error_message)
    .bind(task.updated_at.to_rfc3339())
    .bind(task.started_at.map(|t| t.to_rfc3339()))
    .bind(task.completed_at.map(|t| t.to_rfc3339()))
    .bind(task.id.as_str())
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(task_not_found(&task.id));
    }
    Ok(())
}

/// Delete a task and (through the cascade) its modules.
///
/// Returns `false` if the task did not exist.
pub async fn delete_task(conn: &mut SqliteConnection, id: &TaskId) -> Result<bool> {
    let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
        .bind(id.as_str())
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected() > 0)
}

fn task_not_found(id: &TaskId) -> DatabaseError {
    DatabaseError::NotFoundWithMessage(format!("Task '{id}' not found"))
}

fn task_from_row(row: &SqliteRow) -> Result<Task> {
    let id: String = row.try_get("id")?;
    let options: String = row.try_get("options")?;
    let ai_mode: String = row.try_get("ai_mode")?;
    let user_id: Option<String> = row.try_get("user_id")?;
    let status: String = row.try_get("status")?;
    let results: String = row.try_get("results")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    let options: BTreeSet<AnalysisOption> = serde_json::from_str(&options)
        .map_err(|e| DatabaseError::Decode(format!("invalid options for task '{id}': {e}")))?;
    let results: TaskResults = serde_json::from_str(&results)
        .map_err(|e| DatabaseError::Decode(format!("invalid results for task '{id}': {e}")))?;

    Ok(Task {
        id: TaskId::new(id).map_err(|e| DatabaseError::Decode(e.to_string()))?,
        target_url: row.try_get("target_url")?,
        options,
        language: row.try_get("language")?,
        ai_mode: ai_mode
            .parse()
            .map_err(|e: sitescope_core::SiteScopeError| DatabaseError::Decode(e.to_string()))?,
        user_id: user_id
            .map(UserId::new)
            .transpose()
            .map_err(|e| DatabaseError::Decode(e.to_string()))?,
        is_public: row.try_get("is_public")?,
        status: status
            .parse()
            .map_err(|e: sitescope_core::SiteScopeError| DatabaseError::Decode(e.to_string()))?,
        results,
        modules: std::collections::HashMap::new(),
        error_message: row.try_get("error_message")?,
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
        started_at: parse_optional_timestamp("started_at", row.try_get("started_at")?)?,
        completed_at: parse_optional_timestamp("completed_at", row.try_get("completed_at")?)?,
    })
}

/// Stamp `updated_at` with the current time.
pub fn touch(task: &mut Task) {
    task.updated_at = Utc::now();
}
