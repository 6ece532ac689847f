//! Per-task module rows.

use crate::error::{DatabaseError, Result};
use crate::parse_optional_timestamp;
use sitescope_core::{Module, Progress, RunStatus, SiteScopeError, TaskId};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use std::collections::HashMap;

/// Insert one module row for a task.
pub async fn insert_module(
    conn: &mut SqliteConnection,
    task_id: &TaskId,
    module: &Module,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO task_modules (task_id, name, status, progress_current, progress_total,
                                   error, started_at, completed_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(task_id.as_str())
    .bind(&module.name)
    .bind(module.status.as_str())
    .bind(module.progress.current.map(to_i64))
    .bind(module.progress.total.map(to_i64))
    .bind(&module.error)
    .bind(module.started_at.map(|t| t.to_rfc3339()))
    .bind(module.completed_at.map(|t| t.to_rfc3339()))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Load every module of a task, keyed by name.
pub async fn fetch_modules(
    conn: &mut SqliteConnection,
    task_id: &TaskId,
) -> Result<HashMap<String, Module>> {
    let rows = sqlx::query(
        "SELECT name, status, progress_current, progress_total, error, started_at, completed_at
         FROM task_modules WHERE task_id = ?",
    )
    .bind(task_id.as_str())
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| module_from_row(row).map(|m| (m.name.clone(), m)))
        .collect()
}

/// Load a single module.
///
/// # Errors
/// Returns `DatabaseError::NotFoundWithMessage` if the task has no such module.
pub async fn fetch_module(
    conn: &mut SqliteConnection,
    task_id: &TaskId,
    name: &str,
) -> Result<Module> {
    let row = sqlx::query(
        "SELECT name, status, progress_current, progress_total, error, started_at, completed_at
         FROM task_modules WHERE task_id = ? AND name = ?",
    )
    .bind(task_id.as_str())
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| {
        DatabaseError::NotFoundWithMessage(format!("Module '{name}' not found for task '{task_id}'"))
    })?;

    module_from_row(&row)
}

/// Write back a module's status, progress, error and timestamps.
pub async fn update_module(
    conn: &mut SqliteConnection,
    task_id: &TaskId,
    module: &Module,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE task_modules
         SET status = ?, progress_current = ?, progress_total = ?, error = ?,
             started_at = ?, completed_at = ?
         WHERE task_id = ? AND name = ?",
    )
    .bind(module.status.as_str())
    .bind(module.progress.current.map(to_i64))
    .bind(module.progress.total.map(to_i64))
    .bind(&module.error)
    .bind(module.started_at.map(|t| t.to_rfc3339()))
    .bind(module.completed_at.map(|t| t.to_rfc3339()))
    .bind(task_id.as_str())
    .bind(&module.name)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DatabaseError::NotFoundWithMessage(format!(
            "Module '{}' not found for task '{task_id}'",
            module.name
        )));
    }
    Ok(())
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn module_from_row(row: &SqliteRow) -> Result<Module> {
    let status: String = row.try_get("status")?;
    let current: Option<i64> = row.try_get("progress_current")?;
    let total: Option<i64> = row.try_get("progress_total")?;

    Ok(Module {
        name: row.try_get("name")?,
        status: status
            .parse::<RunStatus>()
            .map_err(|e: SiteScopeError| DatabaseError::Decode(e.to_string()))?,
        progress: Progress {
            current: current.and_then(|v| u64::try_from(v).ok()),
            total: total.and_then(|v| u64::try_from(v).ok()),
        },
        error: row.try_get("error")?,
        started_at: parse_optional_timestamp("started_at", row.try_get("started_at")?)?,
        completed_at: parse_optional_timestamp("completed_at", row.try_get("completed_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks;
    use crate::test_support::setup_test_db;
    use chrono::Utc;
    use sitescope_core::{AnalysisOption, Task, TaskResults};

    async fn insert_bare_task(conn: &mut SqliteConnection) -> TaskId {
        let now = Utc::now();
        let task = Task {
            id: TaskId::generate(),
            target_url: "https://example.com".to_string(),
            options: [AnalysisOption::LinkHealth].into_iter().collect(),
            language: "en".to_string(),
            ai_mode: sitescope_core::AiMode::Standard,
            user_id: None,
            is_public: false,
            status: RunStatus::Pending,
            results: TaskResults::default(),
            modules: HashMap::new(),
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };
        tasks::insert_task(conn, &task).await.expect("insert task");
        task.id
    }

    #[tokio::test]
    async fn test_module_roundtrip_with_progress() {
        let db = setup_test_db().await;
        let mut conn = db.pool().acquire().await.unwrap();
        let task_id = insert_bare_task(&mut conn).await;

        let mut module = Module::pending("crawler");
        insert_module(&mut conn, &task_id, &module).await.unwrap();

        module.status = RunStatus::Running;
        module.started_at = Some(Utc::now());
        module.progress = Progress {
            current: Some(12),
            total: Some(40),
        };
        update_module(&mut conn, &task_id, &module).await.unwrap();

        let loaded = fetch_module(&mut conn, &task_id, "crawler").await.unwrap();
        assert_eq!(loaded.status, RunStatus::Running);
        assert_eq!(loaded.progress.current, Some(12));
        assert_eq!(loaded.progress.total, Some(40));
        assert!(loaded.started_at.is_some());
        assert!(loaded.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_missing_module() {
        let db = setup_test_db().await;
        let mut conn = db.pool().acquire().await.unwrap();
        let task_id = insert_bare_task(&mut conn).await;

        let err = fetch_module(&mut conn, &task_id, "nope").await.unwrap_err();
        assert!(err.to_string().contains("Module 'nope' not found"));

        let err = update_module(&mut conn, &task_id, &Module::pending("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFoundWithMessage(_)));
    }

    #[tokio::test]
    async fn test_module_requires_existing_task() {
        let db = setup_test_db().await;
        let mut conn = db.pool().acquire().await.unwrap();

        let result = insert_module(&mut conn, &TaskId::generate(), &Module::pending("seo")).await;
        assert!(result.is_err(), "foreign key should reject orphan modules");
    }
}
