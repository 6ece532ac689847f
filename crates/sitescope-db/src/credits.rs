//! Per-user credit balances.
//!
//! Each user has one `user_credits` row holding the prepaid balance and the
//! subscription quota for the current `YYYY-MM` period.

use crate::error::Result;
use crate::parse_timestamp;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

/// Credit state of one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCredits {
    /// Owning user
    pub user_id: String,
    /// Prepaid balance
    pub balance: i64,
    /// Monthly subscription allowance
    pub subscription_quota: i64,
    /// Allowance consumed in `quota_period`
    pub subscription_used: i64,
    /// Period the `subscription_used` counter belongs to (`YYYY-MM`)
    pub quota_period: String,
    /// Last write time
    pub updated_at: DateTime<Utc>,
}

impl UserCredits {
    /// Subscription allowance left in the current period.
    #[must_use]
    pub fn subscription_remaining(&self) -> i64 {
        (self.subscription_quota - self.subscription_used).max(0)
    }

    /// Reset `subscription_used` if the stored period is not `period`.
    ///
    /// Returns `true` if the counter was reset.
    pub fn roll_period(&mut self, period: &str) -> bool {
        if self.quota_period == period {
            return false;
        }
        self.quota_period = period.to_string();
        self.subscription_used = 0;
        true
    }
}

/// Quota period string (`YYYY-MM`) for a point in time.
#[must_use]
pub fn quota_period(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}

/// Take the write lock on a user's credit row inside the caller's transaction,
/// creating an empty row if the user has none yet, and return its contents.
///
/// This must be the first statement of the transaction.
pub async fn lock_user_credits(
    conn: &mut SqliteConnection,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<UserCredits> {
    sqlx::query(
        r"
        INSERT INTO user_credits (user_id, balance, subscription_quota, subscription_used,
                                  quota_period, updated_at)
        VALUES (?, 0, 0, 0, ?, ?)
        ON CONFLICT(user_id) DO UPDATE SET updated_at = user_credits.updated_at
        ",
    )
    .bind(user_id)
    .bind(quota_period(now))
    .bind(now.to_rfc3339())
    .execute(&mut *conn)
    .await?;

    let row = sqlx::query(
        "SELECT user_id, balance, subscription_quota, subscription_used, quota_period, updated_at
         FROM user_credits WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_one(&mut *conn)
    .await?;

    credits_from_row(&row)
}

/// Read a user's credits without locking. Returns `None` for unknown users.
pub async fn get_user_credits(pool: &SqlitePool, user_id: &str) -> Result<Option<UserCredits>> {
    let row = sqlx::query(
        "SELECT user_id, balance, subscription_quota, subscription_used, quota_period, updated_at
         FROM user_credits WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(credits_from_row).transpose()
}

/// Write back a locked credit row.
pub async fn save_user_credits(conn: &mut SqliteConnection, credits: &UserCredits) -> Result<()> {
    sqlx::query(
        "UPDATE user_credits
         SET balance = ?, subscription_quota = ?, subscription_used = ?, quota_period = ?,
             updated_at = ?
         WHERE user_id = ?",
    )
    .bind(credits.balance)
    .bind(credits.subscription_quota)
    .bind(credits.subscription_used)
    .bind(&credits.quota_period)
    .bind(credits.updated_at.to_rfc3339())
    .bind(&credits.user_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

fn credits_from_row(row: &SqliteRow) -> Result<UserCredits> {
    let updated_at: String = row.try_get("updated_at")?;
    Ok(UserCredits {
        user_id: row.try_get("user_id")?,
        balance: row.try_get("balance")?,
        subscription_quota: row.try_get("subscription_quota")?,
        subscription_used: row.try_get("subscription_used")?,
        quota_period: row.try_get("quota_period")?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::setup_test_db;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_lock_creates_missing_row() {
        let db = setup_test_db().await;
        assert!(get_user_credits(db.pool(), "alice").await.unwrap().is_none());

        let now = Utc::now();
        let mut tx = db.pool().begin().await.unwrap();
        let credits = lock_user_credits(&mut tx, "alice", now).await.unwrap();
        assert_eq!(credits.balance, 0);
        assert_eq!(credits.quota_period, quota_period(now));
        tx.commit().await.unwrap();

        assert!(get_user_credits(db.pool(), "alice").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let db = setup_test_db().await;
        let now = Utc::now();

        let mut tx = db.pool().begin().await.unwrap();
        let mut credits = lock_user_credits(&mut tx, "bob", now).await.unwrap();
        credits.balance = 40;
        credits.subscription_quota = 100;
        credits.subscription_used = 30;
        save_user_credits(&mut tx, &credits).await.unwrap();
        tx.commit().await.unwrap();

        let loaded = get_user_credits(db.pool(), "bob").await.unwrap().unwrap();
        assert_eq!(loaded.balance, 40);
        assert_eq!(loaded.subscription_remaining(), 70);
    }

    #[test]
    fn test_roll_period_resets_usage() {
        let at = Utc.with_ymd_and_hms(2026, 3, 31, 23, 59, 0).unwrap();
        let mut credits = UserCredits {
            user_id: "carol".to_string(),
            balance: 0,
            subscription_quota: 50,
            subscription_used: 50,
            quota_period: quota_period(at),
            updated_at: at,
        };
        assert_eq!(credits.quota_period, "2026-03");
        assert!(!credits.roll_period("2026-03"));
        assert_eq!(credits.subscription_remaining(), 0);

        assert!(credits.roll_period("2026-04"));
        assert_eq!(credits.subscription_used, 0);
        assert_eq!(credits.subscription_remaining(), 50);
    }
}
