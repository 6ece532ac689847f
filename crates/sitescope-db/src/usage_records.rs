//! Usage records: reservations and their settlement.
//!
//! A record is created unsettled (`settled_at IS NULL`), optionally linked to
//! a task later, and then either settled exactly once or deleted. Settlement
//! claims rows with `UPDATE ... WHERE settled_at IS NULL RETURNING`, so a
//! record can never be claimed twice.

use crate::error::{DatabaseError, Result};
use crate::{parse_optional_timestamp, parse_timestamp};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use std::fmt;

const RECORD_COLUMNS: &str = "id, user_id, task_id, feature_code, credits_charged, is_free, \
     funding, settled_at, refunded, scan_date, created_at";

/// Where the credits of a record come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundingSource {
    /// Counted against the monthly subscription quota
    Subscription,
    /// Debited from the prepaid balance
    Balance,
}

impl FundingSource {
    /// Storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Subscription => "subscription",
            Self::Balance => "balance",
        }
    }
}

impl fmt::Display for FundingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One charge (or open reservation) for one feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Unique identifier
    pub id: String,
    /// Charged user
    pub user_id: String,
    /// Task the charge belongs to, once linked
    pub task_id: Option<String>,
    /// Feature code
    pub feature_code: String,
    /// Credits charged
    pub credits_charged: i64,
    /// Whether the feature was free
    pub is_free: bool,
    /// Funding source chosen at reservation time
    pub funding: FundingSource,
    /// Set once the record has been debited
    pub settled_at: Option<DateTime<Utc>>,
    /// Set once a settled record has been refunded
    pub refunded: bool,
    /// Day the scan was requested
    pub scan_date: NaiveDate,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl UsageRecord {
    /// A fresh, unsettled reservation.
    #[must_use]
    pub fn reservation(
        user_id: impl Into<String>,
        feature_code: impl Into<String>,
        credits_charged: i64,
        funding: FundingSource,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            task_id: None,
            feature_code: feature_code.into(),
            credits_charged,
            is_free: credits_charged == 0,
            funding,
            settled_at: None,
            refunded: false,
            scan_date: now.date_naive(),
            created_at: now,
        }
    }

    /// Whether the record is still an open reservation.
    #[must_use]
    pub fn is_unsettled(&self) -> bool {
        self.settled_at.is_none()
    }
}

/// Insert a reservation.
pub async fn insert_usage_record(conn: &mut SqliteConnection, record: &UsageRecord) -> Result<()> {
    sqlx::query(
        "INSERT INTO usage_records (id, user_id, task_id, feature_code, credits_charged, is_free,
                                    funding, settled_at, refunded, scan_date, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&record.id)
    .bind(&record.user_id)
    .bind(&record.task_id)
    .bind(&record.feature_code)
    .bind(record.credits_charged)
    .bind(record.is_free)
    .bind(record.funding.as_str())
    .bind(record.settled_at.map(|t| t.to_rfc3339()))
    .bind(record.refunded)
    .bind(record.scan_date.to_string())
    .bind(record.created_at.to_rfc3339())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Sum of a user's open reservations, per funding source: `(subscription, balance)`.
pub async fn unsettled_totals(conn: &mut SqliteConnection, user_id: &str) -> Result<(i64, i64)> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT funding, COALESCE(SUM(credits_charged), 0)
         FROM usage_records
         WHERE user_id = ? AND settled_at IS NULL AND refunded = 0
         GROUP BY funding",
    )
    .bind(user_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut totals = (0, 0);
    for (funding, sum) in rows {
        match funding.as_str() {
            "subscription" => totals.0 = sum,
            "balance" => totals.1 = sum,
            other => {
                return Err(DatabaseError::Decode(format!(
                    "invalid funding source '{other}'"
                )))
            }
        }
    }
    Ok(totals)
}

/// Attach reservations to a task. Returns the number of records linked.
pub async fn link_to_task(pool: &SqlitePool, record_ids: &[String], task_id: &str) -> Result<u64> {
    if record_ids.is_empty() {
        return Ok(0);
    }

    let mut builder: QueryBuilder<'_, Sqlite> =
        QueryBuilder::new("UPDATE usage_records SET task_id = ");
    builder.push_bind(task_id);
    builder.push(" WHERE settled_at IS NULL AND id IN (");
    let mut ids = builder.separated(", ");
    for id in record_ids {
        ids.push_bind(id);
    }
    ids.push_unseparated(")");

    let result = builder.build().execute(pool).await?;
    Ok(result.rows_affected())
}

/// Users with open reservations on a task.
pub async fn unsettled_users_for_task(pool: &SqlitePool, task_id: &str) -> Result<Vec<String>> {
    let users = sqlx::query_scalar(
        "SELECT DISTINCT user_id FROM usage_records
         WHERE task_id = ? AND settled_at IS NULL AND refunded = 0
         ORDER BY user_id",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await?;

    Ok(users)
}

/// Mark every open reservation of `user_id` on `task_id` settled and return
/// the claimed records. Records claimed by an earlier call are not returned.
pub async fn claim_unsettled_for_task(
    conn: &mut SqliteConnection,
    task_id: &str,
    user_id: &str,
    settled_at: DateTime<Utc>,
) -> Result<Vec<UsageRecord>> {
    let rows = sqlx::query(&format!(
        "UPDATE usage_records SET settled_at = ?
         WHERE task_id = ? AND user_id = ? AND settled_at IS NULL AND refunded = 0
         RETURNING {RECORD_COLUMNS}"
    ))
    .bind(settled_at.to_rfc3339())
    .bind(task_id)
    .bind(user_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter().map(record_from_row).collect()
}

/// Delete a task's open reservations, optionally only those for `features`.
/// Returns the number of records deleted.
pub async fn delete_unsettled_for_task(
    pool: &SqlitePool,
    task_id: &str,
    features: Option<&[String]>,
) -> Result<u64> {
    let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
        "DELETE FROM usage_records WHERE settled_at IS NULL AND refunded = 0 AND task_id = ",
    );
    builder.push_bind(task_id);

    if let Some(features) = features {
        if features.is_empty() {
            return Ok(0);
        }
        builder.push(" AND feature_code IN (");
        let mut codes = builder.separated(", ");
        for code in features {
            codes.push_bind(code);
        }
        codes.push_unseparated(")");
    }

    let result = builder.build().execute(pool).await?;
    Ok(result.rows_affected())
}

/// Delete open reservations by ID (used before they are linked to a task).
pub async fn delete_unsettled_by_ids(pool: &SqlitePool, record_ids: &[String]) -> Result<u64> {
    if record_ids.is_empty() {
        return Ok(0);
    }

    let mut builder: QueryBuilder<'_, Sqlite> =
        QueryBuilder::new("DELETE FROM usage_records WHERE settled_at IS NULL AND id IN (");
    let mut ids = builder.separated(", ");
    for id in record_ids {
        ids.push_bind(id);
    }
    ids.push_unseparated(")");

    let result = builder.build().execute(pool).await?;
    Ok(result.rows_affected())
}

/// Load one record.
///
/// # Errors
/// Returns `DatabaseError::NotFoundWithMessage` if the record does not exist.
pub async fn fetch_usage_record(conn: &mut SqliteConnection, id: &str) -> Result<UsageRecord> {
    let row = sqlx::query(&format!(
        "SELECT {RECORD_COLUMNS} FROM usage_records WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| DatabaseError::NotFoundWithMessage(format!("Usage record '{id}' not found")))?;

    record_from_row(&row)
}

/// Flag a settled record as refunded. Returns `false` if it was not eligible.
pub async fn mark_refunded(conn: &mut SqliteConnection, id: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE usage_records SET refunded = 1
         WHERE id = ? AND settled_at IS NOT NULL AND refunded = 0",
    )
    .bind(id)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Every record of a task, oldest first.
pub async fn records_for_task(pool: &SqlitePool, task_id: &str) -> Result<Vec<UsageRecord>> {
    let rows = sqlx::query(&format!(
        "SELECT {RECORD_COLUMNS} FROM usage_records WHERE task_id = ? ORDER BY created_at, id"
    ))
    .bind(task_id)
    .fetch_all(pool)
    .await?;

    rows.iter().map(record_from_row).collect()
}

fn record_from_row(row: &SqliteRow) -> Result<UsageRecord> {
    let funding: String = row.try_get("funding")?;
    let funding = match funding.as_str() {
        "subscription" => FundingSource::Subscription,
        "balance" => FundingSource::Balance,
        other => {
            return Err(DatabaseError::Decode(format!(
                "invalid funding source '{other}'"
            )))
        }
    };
    let scan_date: String = row.try_get("scan_date")?;
    let scan_date = scan_date
        .parse::<NaiveDate>()
        .map_err(|e| DatabaseError::Decode(format!("invalid scan_date '{scan_date}': {e}")))?;
    let created_at: String = row.try_get("created_at")?;

    Ok(UsageRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        task_id: row.try_get("task_id")?,
        feature_code: row.try_get("feature_code")?,
        credits_charged: row.try_get("credits_charged")?,
        is_free: row.try_get("is_free")?,
        funding,
        settled_at: parse_optional_timestamp("settled_at", row.try_get("settled_at")?)?,
        refunded: row.try_get("refunded")?,
        scan_date,
        created_at: parse_timestamp("created_at", &created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::setup_test_db;

    async fn reserve(pool: &SqlitePool, user: &str, feature: &str, cost: i64) -> UsageRecord {
        let record = UsageRecord::reservation(user, feature, cost, FundingSource::Balance, Utc::now());
        let mut conn = pool.acquire().await.unwrap();
        insert_usage_record(&mut conn, &record).await.unwrap();
        record
    }

    #[tokio::test]
    async fn test_claim_is_exactly_once() {
        let db = setup_test_db().await;
        let a = reserve(db.pool(), "alice", "seo", 5).await;
        let b = reserve(db.pool(), "alice", "performance", 5).await;
        link_to_task(db.pool(), &[a.id.clone(), b.id.clone()], "task-1")
            .await
            .unwrap();

        let mut conn = db.pool().acquire().await.unwrap();
        let first = claim_unsettled_for_task(&mut conn, "task-1", "alice", Utc::now())
            .await
            .unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|r| r.settled_at.is_some()));

        let second = claim_unsettled_for_task(&mut conn, "task-1", "alice", Utc::now())
            .await
            .unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_unsettled_totals_by_funding() {
        let db = setup_test_db().await;
        reserve(db.pool(), "bob", "seo", 5).await;
        reserve(db.pool(), "bob", "link_health", 10).await;
        let sub = UsageRecord::reservation(
            "bob",
            "security",
            5,
            FundingSource::Subscription,
            Utc::now(),
        );
        let mut conn = db.pool().acquire().await.unwrap();
        insert_usage_record(&mut conn, &sub).await.unwrap();

        let totals = unsettled_totals(&mut conn, "bob").await.unwrap();
        assert_eq!(totals, (5, 15));
        assert_eq!(unsettled_totals(&mut conn, "nobody").await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn test_delete_unsettled_with_feature_filter() {
        let db = setup_test_db().await;
        let a = reserve(db.pool(), "carol", "seo", 5).await;
        let b = reserve(db.pool(), "carol", "link_health", 10).await;
        link_to_task(db.pool(), &[a.id, b.id], "task-2").await.unwrap();

        let deleted = delete_unsettled_for_task(db.pool(), "task-2", Some(&["link_health".to_string()]))
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        let remaining = records_for_task(db.pool(), "task-2").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].feature_code, "seo");

        assert_eq!(
            delete_unsettled_for_task(db.pool(), "task-2", Some(&[])).await.unwrap(),
            0
        );
        assert_eq!(
            delete_unsettled_for_task(db.pool(), "task-2", None).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_settled_records_survive_delete() {
        let db = setup_test_db().await;
        let a = reserve(db.pool(), "dave", "seo", 5).await;
        link_to_task(db.pool(), &[a.id.clone()], "task-3").await.unwrap();
        {
            let mut conn = db.pool().acquire().await.unwrap();
            claim_unsettled_for_task(&mut conn, "task-3", "dave", Utc::now())
                .await
                .unwrap();
        }

        assert_eq!(delete_unsettled_for_task(db.pool(), "task-3", None).await.unwrap(), 0);
        assert_eq!(delete_unsettled_by_ids(db.pool(), &[a.id.clone()]).await.unwrap(), 0);

        let mut conn = db.pool().acquire().await.unwrap();
        assert!(mark_refunded(&mut conn, &a.id).await.unwrap());
        assert!(!mark_refunded(&mut conn, &a.id).await.unwrap());
        let loaded = fetch_usage_record(&mut conn, &a.id).await.unwrap();
        assert!(loaded.refunded);
    }

    #[tokio::test]
    async fn test_unsettled_users_for_task() {
        let db = setup_test_db().await;
        let a = reserve(db.pool(), "erin", "seo", 5).await;
        let b = reserve(db.pool(), "frank", "seo", 5).await;
        link_to_task(db.pool(), &[a.id, b.id], "task-4").await.unwrap();

        let users = unsettled_users_for_task(db.pool(), "task-4").await.unwrap();
        assert_eq!(users, vec!["erin".to_string(), "frank".to_string()]);
        let records = records_for_task(db.pool(), "task-4").await.unwrap();
        assert!(records.iter().all(UsageRecord::is_unsettled));
    }
}
