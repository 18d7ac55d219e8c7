//! Runs against a real MongoDB: `MONGODB_TEST_URL=mongodb://localhost:27017 cargo test -- --ignored`

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;

use carmarket_payments::database::connection::get_db_client;
use carmarket_payments::database::{MongoLedger, TransactionLedger, Transition};
use carmarket_payments::models::{NewTransaction, PaymentPurpose, TransactionState};

async fn ledger() -> Option<(MongoLedger, mongodb::Database)> {
    let url = std::env::var("MONGODB_TEST_URL").ok()?;
    let name = format!("carmarket_test_{}", uuid::Uuid::new_v4().simple());
    let db = get_db_client(&url, &name).await.unwrap();
    let ledger = MongoLedger::new(db.clone());
    ledger.ensure_indexes().await.unwrap();
    Some((ledger, db))
}

fn deposit(amount: i64) -> NewTransaction {
    NewTransaction {
        payer_reference: "254712345678".into(),
        amount: Decimal::from(amount),
        purpose: PaymentPurpose::Deposit,
        subject_reference: "car:42".into(),
    }
}

#[tokio::test]
#[ignore]
async fn mongo_ledger_transitions_are_conditional() {
    let Some((ledger, db)) = ledger().await else { return };

    let tx = ledger.create(deposit(1500)).await.unwrap();
    let pushed = ledger.attach_correlation(&tx.id, "ws_CO_M1").await.unwrap();
    assert_eq!(pushed.state, TransactionState::Pushed);

    let other = ledger.create(deposit(10)).await.unwrap();
    let err = ledger.attach_correlation(&other.id, "ws_CO_M1").await.unwrap_err();
    assert_eq!(err.kind(), "duplicate_correlation");

    let settled = ledger
        .settle("ws_CO_M1", "QGR7XYZ1", Some(Decimal::from(1500)))
        .await
        .unwrap();
    assert!(settled.applied());
    assert_eq!(settled.record().state, TransactionState::Settled);

    let again = ledger.fail("ws_CO_M1", "Request cancelled by user").await.unwrap();
    assert!(matches!(again, Transition::Unchanged(_)));

    let err = ledger.settle("ws_CO_missing", "R", None).await.unwrap_err();
    assert_eq!(err.kind(), "unknown_correlation");

    db.drop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn mongo_ledger_settles_once_under_concurrency() {
    let Some((ledger, db)) = ledger().await else { return };
    let ledger = Arc::new(ledger);

    let tx = ledger.create(deposit(2000)).await.unwrap();
    ledger.attach_correlation(&tx.id, "ws_CO_M2").await.unwrap();

    let mut handles = Vec::new();
    for i in 0..16 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            if i % 4 == 0 {
                ledger
                    .expire_stale(Utc::now() + Duration::seconds(5))
                    .await
                    .map(|expired| !expired.is_empty())
            } else {
                ledger
                    .settle("ws_CO_M2", "QGR7XYZ1", Some(Decimal::from(2000)))
                    .await
                    .map(|t| t.applied())
            }
        }));
    }

    let mut applied = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap() {
            applied += 1;
        }
    }
    assert_eq!(applied, 1);

    let stored = ledger.get_by_id(&tx.id).await.unwrap().unwrap();
    assert!(stored.is_terminal());

    db.drop().await.unwrap();
}
