use sitescope_core::{TaskId, UserId};
use sitescope_db::pricing::{upsert_feature_pricing, FeatureCategory, FeaturePricing};
use sitescope_db::Database;
use sitescope_ledger::{CreditLedger, LedgerError};

async fn setup() -> (Database, CreditLedger) {
    let db = Database::new(":memory:").await.expect("create database");
    db.run_migrations().await.expect("run migrations");
    let ledger = CreditLedger::new(db.pool().clone());
    (db, ledger)
}

async fn price(db: &Database, code: &str, cost: i64) {
    upsert_feature_pricing(
        db.pool(),
        &FeaturePricing {
            code: code.to_string(),
            credits_cost: cost,
            category: FeatureCategory::Premium,
            active: true,
        },
    )
    .await
    .expect("set price");
}

fn codes(features: &[&str]) -> Vec<String> {
    features.iter().map(|f| (*f).to_string()).collect()
}

#[tokio::test]
async fn test_reservation_is_all_or_nothing() {
    let (db, ledger) = setup().await;
    price(&db, "feature_a", 10).await;
    price(&db, "feature_b", 20).await;
    let user = UserId::new("alice").unwrap();
    ledger.grant_credits(&user, 25).await.unwrap();

    let err = ledger
        .create_usage_records(Some(&user), &codes(&["feature_a", "feature_b"]))
        .await
        .unwrap_err();

    match err {
        LedgerError::InsufficientCredits {
            feature,
            required,
            available,
        } => {
            assert_eq!(feature, "feature_b");
            assert_eq!(required, 20);
            assert_eq!(available, 15);
        }
        other => panic!("expected InsufficientCredits, got {other:?}"),
    }

    let records: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM usage_records")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(records, 0, "no record may survive a rejected reservation");
    assert_eq!(ledger.get_credits(&user).await.unwrap().balance, 25);
}

#[tokio::test]
async fn test_rejection_names_feature_cost_and_balance() {
    let (db, ledger) = setup().await;
    price(&db, "deep_crawl", 10).await;
    let user = UserId::new("bob").unwrap();
    ledger.grant_credits(&user, 5).await.unwrap();

    let err = ledger
        .create_usage_records(Some(&user), &codes(&["deep_crawl"]))
        .await
        .unwrap_err();

    let message = err.to_string();
    assert!(message.contains("deep_crawl"));
    assert!(message.contains("requires 10"));
    assert!(message.contains("available 5"));
}

#[tokio::test]
async fn test_settlement_is_idempotent() {
    let (_db, ledger) = setup().await;
    let user = UserId::new("carol").unwrap();
    ledger.grant_credits(&user, 100).await.unwrap();

    let reservation = ledger
        .create_usage_records(Some(&user), &codes(&["performance", "seo"]))
        .await
        .unwrap();
    assert_eq!(reservation.records.len(), 2);

    let task_id = TaskId::generate();
    assert_eq!(
        ledger
            .link_records_to_task(&reservation, &task_id)
            .await
            .unwrap(),
        2
    );

    let first = ledger.settle_task_credits(&task_id).await.unwrap();
    assert_eq!(first.records_settled, 2);
    assert_eq!(first.balance_debited, 10);

    let second = ledger.settle_task_credits(&task_id).await.unwrap();
    assert_eq!(second.records_settled, 0);
    assert_eq!(second.balance_debited, 0);

    assert_eq!(ledger.get_credits(&user).await.unwrap().balance, 90);

    let records = ledger.usage_records_for_task(&task_id).await.unwrap();
    assert!(records.iter().all(|r| r.settled_at.is_some()));

    // Settled records are never discarded
    assert_eq!(
        ledger.delete_unsettled_records(&task_id, None).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn test_concurrent_settlement_debits_once() {
    let (_db, ledger) = setup().await;
    let user = UserId::new("dave").unwrap();
    ledger.grant_credits(&user, 50).await.unwrap();

    let reservation = ledger
        .create_usage_records(Some(&user), &codes(&["link_health"]))
        .await
        .unwrap();
    let task_id = TaskId::generate();
    ledger
        .link_records_to_task(&reservation, &task_id)
        .await
        .unwrap();

    let results = futures::future::join_all(
        (0..4).map(|_| {
            let ledger = ledger.clone();
            let task_id = task_id.clone();
            async move { ledger.settle_task_credits(&task_id).await }
        }),
    )
    .await;

    let settled: usize = results
        .into_iter()
        .map(|r| r.expect("settle").records_settled)
        .sum();
    assert_eq!(settled, 1);
    assert_eq!(ledger.get_credits(&user).await.unwrap().balance, 40);
}

#[tokio::test]
async fn test_concurrent_reservations_never_overdraw() {
    let (_db, ledger) = setup().await;
    let user = UserId::new("erin").unwrap();
    ledger.grant_credits(&user, 30).await.unwrap();

    let results = futures::future::join_all((0..5).map(|_| {
        let ledger = ledger.clone();
        let user = user.clone();
        async move {
            ledger
                .create_usage_records(Some(&user), &codes(&["link_health"]))
                .await
        }
    }))
    .await;

    let granted = results.iter().filter(|r| r.is_ok()).count();
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(LedgerError::InsufficientCredits { .. })))
        .count();
    assert_eq!(granted, 3);
    assert_eq!(rejected, 2);
}

#[tokio::test]
async fn test_discard_only_failed_features() {
    let (_db, ledger) = setup().await;
    let user = UserId::new("frank").unwrap();
    ledger.grant_credits(&user, 100).await.unwrap();

    let reservation = ledger
        .create_usage_records(Some(&user), &codes(&["seo", "link_health"]))
        .await
        .unwrap();
    let task_id = TaskId::generate();
    ledger
        .link_records_to_task(&reservation, &task_id)
        .await
        .unwrap();

    let discarded = ledger
        .delete_unsettled_records(&task_id, Some(&codes(&["link_health"])))
        .await
        .unwrap();
    assert_eq!(discarded, 1);

    let settlement = ledger.settle_task_credits(&task_id).await.unwrap();
    assert_eq!(settlement.balance_debited, 5);
    assert_eq!(ledger.get_credits(&user).await.unwrap().balance, 95);
}

#[tokio::test]
async fn test_refund_reverses_balance_settlement_once() {
    let (_db, ledger) = setup().await;
    let user = UserId::new("gina").unwrap();
    ledger.grant_credits(&user, 20).await.unwrap();

    let reservation = ledger
        .create_usage_records(Some(&user), &codes(&["link_health"]))
        .await
        .unwrap();
    let record_id = reservation.records[0].id.clone();

    assert!(matches!(
        ledger.refund_usage_record(&record_id).await,
        Err(LedgerError::NotSettled(_))
    ));

    let task_id = TaskId::generate();
    ledger
        .link_records_to_task(&reservation, &task_id)
        .await
        .unwrap();
    ledger.settle_task_credits(&task_id).await.unwrap();
    assert_eq!(ledger.get_credits(&user).await.unwrap().balance, 10);

    ledger.refund_usage_record(&record_id).await.unwrap();
    assert_eq!(ledger.get_credits(&user).await.unwrap().balance, 20);

    assert!(matches!(
        ledger.refund_usage_record(&record_id).await,
        Err(LedgerError::AlreadyRefunded(_))
    ));
    assert_eq!(ledger.get_credits(&user).await.unwrap().balance, 20);
}

#[tokio::test]
async fn test_unlinked_reservation_can_be_discarded() {
    let (_db, ledger) = setup().await;
    let user = UserId::new("hank").unwrap();
    ledger.grant_credits(&user, 10).await.unwrap();

    let reservation = ledger
        .create_usage_records(Some(&user), &codes(&["seo"]))
        .await
        .unwrap();
    assert_eq!(ledger.discard_reservation(&reservation).await.unwrap(), 1);

    // The freed credits are available again
    assert!(ledger
        .create_usage_records(Some(&user), &codes(&["seo", "security"]))
        .await
        .is_ok());
}
