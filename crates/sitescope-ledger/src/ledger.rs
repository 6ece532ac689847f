//! The credit ledger.
//!
//! Paid features are reserved before a task runs (unsettled usage records,
//! balance untouched) and, once the task is terminal, either settled (debited
//! once) or discarded (deleted).
//!
//! Every read-modify-write of a user's credits runs in one transaction that
//! starts by locking the user's `user_credits` row, so concurrent
//! reservations, settlements and refunds for the same user serialize. An
//! in-process mutex per user additionally keeps reservation bursts from one
//! user off the database lock.

use crate::error::{LedgerError, Result};
use chrono::Utc;
use sitescope_core::{TaskId, UserId};
use sitescope_db::credits::{self, quota_period, UserCredits};
use sitescope_db::usage_records::{self, FundingSource, UsageRecord};
use sitescope_db::{pricing, FeatureCategory};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Reserved usage records for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reservation {
    /// The unsettled records created
    pub records: Vec<UsageRecord>,
}

impl Reservation {
    /// IDs of the reserved records.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.records.iter().map(|r| r.id.clone()).collect()
    }

    /// Total credits reserved.
    #[must_use]
    pub fn total(&self) -> i64 {
        self.records.iter().map(|r| r.credits_charged).sum()
    }

    /// Whether nothing was reserved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Outcome of settling a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Settlement {
    /// Records marked settled by this call
    pub records_settled: usize,
    /// Credits debited from balances
    pub balance_debited: i64,
    /// Credits added to subscription usage
    pub subscription_used: i64,
}

/// Credit ledger over the `SiteScope` database.
#[derive(Clone)]
pub struct CreditLedger {
    pool: SqlitePool,
    user_locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl std::fmt::Debug for CreditLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreditLedger").finish_non_exhaustive()
    }
}

impl CreditLedger {
    /// Create a ledger over `pool`.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            user_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn user_lock(&self, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .user_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    // Drops the user's entry once no reservation holds or waits on it.
    fn prune_user_lock(&self, user_id: &str) {
        let mut locks = self
            .user_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(user_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(user_id);
        }
    }

    /// Reserve the cost of `features` for `user_id`.
    ///
    /// All-or-nothing: if any paid feature cannot be funded, no record is
    /// created. Subscription quota is used before the prepaid balance; both
    /// are net of the user's other unsettled reservations. Basic features are
    /// free and never reserved.
    ///
    /// # Errors
    /// - `LedgerError::InsufficientCredits` naming the first unfundable feature
    /// - `LedgerError::AccountRequired` if an anonymous caller asks for a paid feature
    /// - `LedgerError::UnknownFeature` / `InactiveFeature` for unpriced or disabled features
    pub async fn create_usage_records(
        &self,
        user_id: Option<&UserId>,
        features: &[String],
    ) -> Result<Reservation> {
        let mut seen = HashSet::new();
        let features: Vec<&str> = features
            .iter()
            .map(String::as_str)
            .filter(|f| seen.insert(*f))
            .collect();

        let Some(user_id) = user_id else {
            self.check_anonymous(&features).await?;
            return Ok(Reservation::default());
        };
        let user = user_id.as_str();

        let lock = self.user_lock(user);
        let result = {
            let _guard = lock.lock().await;
            self.reserve_for_user(user, &features).await
        };
        drop(lock);
        self.prune_user_lock(user);
        result
    }

    async fn reserve_for_user(&self, user: &str, features: &[&str]) -> Result<Reservation> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut credits = credits::lock_user_credits(&mut tx, user, now).await?;
        if credits.roll_period(&quota_period(now)) {
            credits.updated_at = now;
            credits::save_user_credits(&mut tx, &credits).await?;
        }

        let (reserved_subscription, reserved_balance) =
            usage_records::unsettled_totals(&mut tx, user).await?;
        let mut available_subscription = credits.subscription_remaining() - reserved_subscription;
        let mut available_balance = credits.balance - reserved_balance;

        let mut records = Vec::new();
        for &feature in features {
            let price = pricing::get_feature_pricing(&mut tx, feature)
                .await?
                .ok_or_else(|| LedgerError::UnknownFeature(feature.to_string()))?;
            if !price.active {
                return Err(LedgerError::InactiveFeature(feature.to_string()));
            }
            if price.category == FeatureCategory::Basic {
                continue;
            }

            let cost = price.credits_cost;
            let funding = if cost == 0 {
                FundingSource::Balance
            } else if available_subscription >= cost {
                available_subscription -= cost;
                FundingSource::Subscription
            } else if available_balance >= cost {
                available_balance -= cost;
                FundingSource::Balance
            } else {
                warn!(
                    user_id = %user,
                    feature,
                    required = cost,
                    available = available_balance,
                    "Reservation rejected"
                );
                return Err(LedgerError::InsufficientCredits {
                    feature: feature.to_string(),
                    required: cost,
                    available: available_balance.max(0),
                });
            };

            let record = UsageRecord::reservation(user, feature, cost, funding, now);
            usage_records::insert_usage_record(&mut tx, &record).await?;
            records.push(record);
        }

        tx.commit().await?;

        let reservation = Reservation { records };
        if !reservation.is_empty() {
            info!(
                user_id = %user,
                records = reservation.records.len(),
                credits = reservation.total(),
                "Credits reserved"
            );
        }
        Ok(reservation)
    }

    async fn check_anonymous(&self, features: &[&str]) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        for feature in features {
            let price = pricing::get_feature_pricing(&mut conn, feature)
                .await?
                .ok_or_else(|| LedgerError::UnknownFeature((*feature).to_string()))?;
            if !price.active {
                return Err(LedgerError::InactiveFeature((*feature).to_string()));
            }
            if !price.is_free() {
                return Err(LedgerError::AccountRequired((*feature).to_string()));
            }
        }
        Ok(())
    }

    /// Attach reserved records to the task they pay for.
    pub async fn link_records_to_task(
        &self,
        reservation: &Reservation,
        task_id: &TaskId,
    ) -> Result<u64> {
        let linked =
            usage_records::link_to_task(&self.pool, &reservation.ids(), task_id.as_str()).await?;
        debug!(task_id = %task_id, linked, "Linked reservations to task");
        Ok(linked)
    }

    /// Settle every open reservation of a task.
    ///
    /// Each user's records are claimed and debited in one locked transaction.
    /// Calling this again settles nothing: claimed records carry `settled_at`.
    pub async fn settle_task_credits(&self, task_id: &TaskId) -> Result<Settlement> {
        let users = usage_records::unsettled_users_for_task(&self.pool, task_id.as_str()).await?;
        let mut settlement = Settlement::default();

        for user in users {
            let lock = self.user_lock(&user);
            let _guard = lock.lock().await;

            let now = Utc::now();
            let mut tx = self.pool.begin().await?;
            let mut credits = credits::lock_user_credits(&mut tx, &user, now).await?;
            credits.roll_period(&quota_period(now));

            let claimed =
                usage_records::claim_unsettled_for_task(&mut tx, task_id.as_str(), &user, now)
                    .await?;
            if claimed.is_empty() {
                tx.rollback().await?;
                continue;
            }

            let (from_subscription, from_balance) = split_by_funding(&claimed);
            credits.balance -= from_balance;
            credits.subscription_used += from_subscription;
            credits.updated_at = now;
            credits::save_user_credits(&mut tx, &credits).await?;
            tx.commit().await?;

            info!(
                task_id = %task_id,
                user_id = %user,
                records = claimed.len(),
                balance_debited = from_balance,
                subscription_used = from_subscription,
                "Settled task credits"
            );
            settlement.records_settled += claimed.len();
            settlement.balance_debited += from_balance;
            settlement.subscription_used += from_subscription;
        }

        Ok(settlement)
    }

    /// Delete a task's open reservations, optionally only for `features`.
    pub async fn delete_unsettled_records(
        &self,
        task_id: &TaskId,
        features: Option<&[String]>,
    ) -> Result<u64> {
        let deleted =
            usage_records::delete_unsettled_for_task(&self.pool, task_id.as_str(), features)
                .await?;
        if deleted > 0 {
            info!(task_id = %task_id, deleted, "Discarded reservations");
        }
        Ok(deleted)
    }

    /// Delete a reservation that was never linked to a task.
    pub async fn discard_reservation(&self, reservation: &Reservation) -> Result<u64> {
        let deleted =
            usage_records::delete_unsettled_by_ids(&self.pool, &reservation.ids()).await?;
        if deleted > 0 {
            info!(deleted, "Discarded unlinked reservation");
        }
        Ok(deleted)
    }

    /// Reverse a settled record: re-credit the balance or give back quota.
    ///
    /// # Errors
    /// - `LedgerError::NotSettled` for open reservations
    /// - `LedgerError::AlreadyRefunded` for records refunded before
    pub async fn refund_usage_record(&self, record_id: &str) -> Result<UsageRecord> {
        let user = {
            let mut conn = self.pool.acquire().await?;
            usage_records::fetch_usage_record(&mut conn, record_id)
                .await?
                .user_id
        };

        let lock = self.user_lock(&user);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut credits = credits::lock_user_credits(&mut tx, &user, now).await?;
        let mut record = usage_records::fetch_usage_record(&mut tx, record_id).await?;

        if record.is_unsettled() {
            return Err(LedgerError::NotSettled(record.id));
        }
        if record.refunded {
            return Err(LedgerError::AlreadyRefunded(record.id));
        }

        credits.roll_period(&quota_period(now));
        match record.funding {
            FundingSource::Balance => credits.balance += record.credits_charged,
            FundingSource::Subscription => {
                credits.subscription_used =
                    (credits.subscription_used - record.credits_charged).max(0);
            }
        }
        credits.updated_at = now;
        credits::save_user_credits(&mut tx, &credits).await?;

        if !usage_records::mark_refunded(&mut tx, &record.id).await? {
            return Err(LedgerError::AlreadyRefunded(record.id));
        }
        tx.commit().await?;

        info!(
            record_id = %record.id,
            user_id = %user,
            credits = record.credits_charged,
            funding = %record.funding,
            "Refunded usage record"
        );
        record.refunded = true;
        Ok(record)
    }

    /// Current credits of a user. Unknown users have an empty account.
    pub async fn get_credits(&self, user_id: &UserId) -> Result<UserCredits> {
        let now = Utc::now();
        let mut credits = credits::get_user_credits(&self.pool, user_id.as_str())
            .await?
            .unwrap_or_else(|| UserCredits {
                user_id: user_id.to_string(),
                balance: 0,
                subscription_quota: 0,
                subscription_used: 0,
                quota_period: quota_period(now),
                updated_at: now,
            });
        credits.roll_period(&quota_period(now));
        Ok(credits)
    }

    /// Add prepaid credits to a user's balance.
    ///
    /// # Errors
    /// Returns `LedgerError::InvalidAmount` unless `amount` is positive.
    pub async fn grant_credits(&self, user_id: &UserId, amount: i64) -> Result<UserCredits> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        self.update_credits(user_id, |credits| credits.balance += amount)
            .await
    }

    /// Set a user's monthly subscription quota.
    ///
    /// # Errors
    /// Returns `LedgerError::InvalidAmount` for negative quotas.
    pub async fn set_subscription_quota(&self, user_id: &UserId, quota: i64) -> Result<UserCredits> {
        if quota < 0 {
            return Err(LedgerError::InvalidAmount(quota));
        }
        self.update_credits(user_id, |credits| credits.subscription_quota = quota)
            .await
    }

    async fn update_credits<F>(&self, user_id: &UserId, apply: F) -> Result<UserCredits>
    where
        F: FnOnce(&mut UserCredits),
    {
        let user = user_id.as_str();
        let lock = self.user_lock(user);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut credits = credits::lock_user_credits(&mut tx, user, now).await?;
        credits.roll_period(&quota_period(now));
        apply(&mut credits);
        credits.updated_at = now;
        credits::save_user_credits(&mut tx, &credits).await?;
        tx.commit().await?;
        Ok(credits)
    }

    /// Every usage record of a task.
    pub async fn usage_records_for_task(&self, task_id: &TaskId) -> Result<Vec<UsageRecord>> {
        Ok(usage_records::records_for_task(&self.pool, task_id.as_str()).await?)
    }
}

fn split_by_funding(records: &[UsageRecord]) -> (i64, i64) {
    records
        .iter()
        .fold((0, 0), |(subscription, balance), r| match r.funding {
            FundingSource::Subscription => (subscription + r.credits_charged, balance),
            FundingSource::Balance => (subscription, balance + r.credits_charged),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitescope_db::{Database, FeaturePricing};

    async fn setup() -> (Database, CreditLedger) {
        let db = Database::new(":memory:").await.expect("create database");
        db.run_migrations().await.expect("run migrations");
        let ledger = CreditLedger::new(db.pool().clone());
        (db, ledger)
    }

    fn codes(features: &[&str]) -> Vec<String> {
        features.iter().map(|f| (*f).to_string()).collect()
    }

    #[tokio::test]
    async fn test_basic_features_are_never_reserved() {
        let (_db, ledger) = setup().await;
        let user = UserId::new("alice").unwrap();

        let reservation = ledger
            .create_usage_records(Some(&user), &codes(&["website_info", "domain_info"]))
            .await
            .expect("reserve");
        assert!(reservation.is_empty());
    }

    #[tokio::test]
    async fn test_subscription_is_used_before_balance() {
        let (_db, ledger) = setup().await;
        let user = UserId::new("bob").unwrap();
        ledger.set_subscription_quota(&user, 5).await.unwrap();
        ledger.grant_credits(&user, 20).await.unwrap();

        let reservation = ledger
            .create_usage_records(Some(&user), &codes(&["seo", "performance"]))
            .await
            .unwrap();

        let funding: Vec<_> = reservation.records.iter().map(|r| r.funding).collect();
        assert_eq!(
            funding,
            vec![FundingSource::Subscription, FundingSource::Balance]
        );
        assert_eq!(reservation.total(), 10);

        // Balance is untouched until settlement
        let credits = ledger.get_credits(&user).await.unwrap();
        assert_eq!(credits.balance, 20);
        assert_eq!(credits.subscription_used, 0);
    }

    #[tokio::test]
    async fn test_reservations_count_against_later_requests() {
        let (_db, ledger) = setup().await;
        let user = UserId::new("carol").unwrap();
        ledger.grant_credits(&user, 12).await.unwrap();

        ledger
            .create_usage_records(Some(&user), &codes(&["link_health"]))
            .await
            .unwrap();

        let err = ledger
            .create_usage_records(Some(&user), &codes(&["seo"]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientCredits { required: 5, available: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_anonymous_users_get_basic_features_only() {
        let (_db, ledger) = setup().await;

        assert!(ledger
            .create_usage_records(None, &codes(&["ssl_info", "tech_stack"]))
            .await
            .unwrap()
            .is_empty());

        let err = ledger
            .create_usage_records(None, &codes(&["ssl_info", "ai_analysis"]))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::AccountRequired(f) if f == "ai_analysis"));
    }

    #[tokio::test]
    async fn test_unknown_and_inactive_features() {
        let (db, ledger) = setup().await;
        let user = UserId::new("dave").unwrap();
        ledger.grant_credits(&user, 100).await.unwrap();

        let err = ledger
            .create_usage_records(Some(&user), &codes(&["teleport"]))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::UnknownFeature(_)));

        pricing::upsert_feature_pricing(
            db.pool(),
            &FeaturePricing {
                code: "seo".to_string(),
                credits_cost: 5,
                category: FeatureCategory::Premium,
                active: false,
            },
        )
        .await
        .unwrap();
        let err = ledger
            .create_usage_records(Some(&user), &codes(&["seo"]))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InactiveFeature(_)));
    }

    #[tokio::test]
    async fn test_zero_cost_premium_feature_is_free_record() {
        let (db, ledger) = setup().await;
        let user = UserId::new("erin").unwrap();
        pricing::upsert_feature_pricing(
            db.pool(),
            &FeaturePricing {
                code: "seo".to_string(),
                credits_cost: 0,
                category: FeatureCategory::Premium,
                active: true,
            },
        )
        .await
        .unwrap();

        let reservation = ledger
            .create_usage_records(Some(&user), &codes(&["seo"]))
            .await
            .unwrap();
        assert_eq!(reservation.records.len(), 1);
        assert!(reservation.records[0].is_free);
    }

    #[tokio::test]
    async fn test_subscription_refund_clamps_at_zero() {
        let (db, ledger) = setup().await;
        let user = UserId::new("frank").unwrap();
        ledger.set_subscription_quota(&user, 50).await.unwrap();

        let reservation = ledger
            .create_usage_records(Some(&user), &codes(&["ai_analysis"]))
            .await
            .unwrap();
        let task_id = TaskId::generate();
        ledger
            .link_records_to_task(&reservation, &task_id)
            .await
            .unwrap();
        ledger.settle_task_credits(&task_id).await.unwrap();
        assert_eq!(ledger.get_credits(&user).await.unwrap().subscription_used, 15);

        // An admin lowers usage behind the ledger's back
        sqlx::query("UPDATE user_credits SET subscription_used = 3 WHERE user_id = ?")
            .bind(user.as_str())
            .execute(db.pool())
            .await
            .unwrap();

        let refunded = ledger
            .refund_usage_record(&reservation.records[0].id)
            .await
            .unwrap();
        assert!(refunded.refunded);
        assert_eq!(ledger.get_credits(&user).await.unwrap().subscription_used, 0);
    }

    #[tokio::test]
    async fn test_invalid_amounts() {
        let (_db, ledger) = setup().await;
        let user = UserId::new("gina").unwrap();
        assert!(matches!(
            ledger.grant_credits(&user, 0).await,
            Err(LedgerError::InvalidAmount(0))
        ));
        assert!(matches!(
            ledger.set_subscription_quota(&user, -1).await,
            Err(LedgerError::InvalidAmount(-1))
        ));
    }

    #[tokio::test]
    async fn test_user_locks_are_dropped_after_reservation() {
        let (_db, ledger) = setup().await;
        let user = UserId::new("hank").unwrap();
        ledger.grant_credits(&user, 10).await.unwrap();

        let seo = codes(&["seo"]);
        let attempts = futures::future::join_all(
            (0..4).map(|_| ledger.create_usage_records(Some(&user), &seo)),
        )
        .await;
        assert_eq!(attempts.iter().filter(|r| r.is_ok()).count(), 2);

        let rejected = ledger
            .create_usage_records(Some(&user), &codes(&["deep_crawl"]))
            .await;
        assert!(matches!(
            rejected,
            Err(LedgerError::InsufficientCredits { .. })
        ));

        assert!(ledger.user_locks.lock().unwrap().is_empty());
    }

    #[test]
    fn test_split_by_funding() {
        let now = Utc::now();
        let records = vec![
            UsageRecord::reservation("u", "seo", 5, FundingSource::Subscription, now),
            UsageRecord::reservation("u", "security", 5, FundingSource::Balance, now),
            UsageRecord::reservation("u", "link_health", 10, FundingSource::Balance, now),
        ];
        assert_eq!(split_by_funding(&records), (5, 15));
    }
}
