// database/memory_ledger.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::ledger::{amount_matches, TransactionLedger, Transition};
use crate::errors::{AppError, Result};
use crate::models::payment_transaction::REASON_AMOUNT_MISMATCH;
use crate::models::{NewTransaction, PaymentTransaction, TransactionState};

#[derive(Default)]
struct Inner {
    by_id: HashMap<String, PaymentTransaction>,
    by_correlation: HashMap<String, String>,
}

/// Process-local ledger used when no database is configured, and in tests.
///
/// The mutex only guards the map for the duration of one conditional write;
/// it is never held across an await.
#[derive(Default)]
pub struct MemoryLedger {
    inner: Mutex<Inner>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| AppError::internal("memory ledger lock poisoned"))
    }

    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.by_id.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inner {
    fn by_correlation_mut(&mut self, correlation_id: &str) -> Result<&mut PaymentTransaction> {
        let id = self
            .by_correlation
            .get(correlation_id)
            .ok_or_else(|| AppError::UnknownCorrelation(correlation_id.to_string()))?;
        self.by_id
            .get_mut(id)
            .ok_or_else(|| AppError::internal(format!("dangling correlation {}", correlation_id)))
    }
}

fn move_to(tx: &mut PaymentTransaction, to: TransactionState) {
    debug_assert!(tx.state.can_transition_to(to), "{} -> {}", tx.state, to);
    tx.state = to;
    tx.updated_at = Utc::now();
}

#[async_trait]
impl TransactionLedger for MemoryLedger {
    async fn create(&self, new: NewTransaction) -> Result<PaymentTransaction> {
        let tx = PaymentTransaction::new(new);
        self.lock()?.by_id.insert(tx.id.clone(), tx.clone());
        Ok(tx)
    }

    async fn attach_correlation(
        &self,
        id: &str,
        correlation_id: &str,
    ) -> Result<PaymentTransaction> {
        let mut inner = self.lock()?;

        if let Some(owner) = inner.by_correlation.get(correlation_id) {
            if owner != id {
                return Err(AppError::DuplicateCorrelation(correlation_id.to_string()));
            }
        }

        let tx = inner
            .by_id
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(id.to_string()))?;

        if tx.state != TransactionState::Created {
            return Err(AppError::InvalidTransition {
                id: id.to_string(),
                from: tx.state.to_string(),
                to: TransactionState::Pushed.to_string(),
            });
        }

        tx.correlation_id = Some(correlation_id.to_string());
        move_to(tx, TransactionState::Pushed);
        let updated = tx.clone();

        inner
            .by_correlation
            .insert(correlation_id.to_string(), id.to_string());
        Ok(updated)
    }

    async fn fail_initiation(&self, id: &str, reason: &str) -> Result<Transition> {
        let mut inner = self.lock()?;
        let tx = inner
            .by_id
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(id.to_string()))?;

        if tx.state != TransactionState::Created {
            return Ok(Transition::Unchanged(tx.clone()));
        }

        tx.failure_reason = Some(reason.to_string());
        move_to(tx, TransactionState::Failed);
        Ok(Transition::Applied(tx.clone()))
    }

    async fn settle(
        &self,
        correlation_id: &str,
        provider_receipt_id: &str,
        confirmed_amount: Option<Decimal>,
    ) -> Result<Transition> {
        let mut inner = self.lock()?;
        let tx = inner.by_correlation_mut(correlation_id)?;

        if tx.state != TransactionState::Pushed {
            return Ok(Transition::Unchanged(tx.clone()));
        }

        if amount_matches(tx.amount, confirmed_amount) {
            tx.provider_receipt_id = Some(provider_receipt_id.to_string());
            move_to(tx, TransactionState::Settled);
        } else {
            tx.failure_reason = Some(REASON_AMOUNT_MISMATCH.to_string());
            move_to(tx, TransactionState::Failed);
        }
        Ok(Transition::Applied(tx.clone()))
    }

    async fn fail(&self, correlation_id: &str, reason: &str) -> Result<Transition> {
        let mut inner = self.lock()?;
        let tx = inner.by_correlation_mut(correlation_id)?;

        if tx.state != TransactionState::Pushed {
            return Ok(Transition::Unchanged(tx.clone()));
        }

        tx.failure_reason = Some(reason.to_string());
        move_to(tx, TransactionState::Failed);
        Ok(Transition::Applied(tx.clone()))
    }

    async fn expire_stale(&self, older_than: DateTime<Utc>) -> Result<Vec<PaymentTransaction>> {
        let mut inner = self.lock()?;
        let expired: Vec<PaymentTransaction> = inner
            .by_id
            .values_mut()
            .filter(|tx| tx.state == TransactionState::Pushed && tx.updated_at < older_than)
            .map(|tx| {
                move_to(tx, TransactionState::Expired);
                tx.clone()
            })
            .collect();
        Ok(expired)
    }

    async fn get_by_correlation(&self, correlation_id: &str) -> Result<Option<PaymentTransaction>> {
        let inner = self.lock()?;
        Ok(inner
            .by_correlation
            .get(correlation_id)
            .and_then(|id| inner.by_id.get(id))
            .cloned())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<PaymentTransaction>> {
        Ok(self.lock()?.by_id.get(id).cloned())
    }

    async fn ping(&self) -> Result<()> {
        self.lock().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PaymentPurpose;
    use std::sync::Arc;

    fn new_tx(amount: i64) -> NewTransaction {
        NewTransaction {
            payer_reference: "254712345678".to_string(),
            amount: Decimal::from(amount),
            purpose: PaymentPurpose::PremiumUpgrade,
            subject_reference: "car:42".to_string(),
        }
    }

    async fn pushed(ledger: &MemoryLedger, correlation_id: &str) -> PaymentTransaction {
        let tx = ledger.create(new_tx(2000)).await.unwrap();
        ledger.attach_correlation(&tx.id, correlation_id).await.unwrap()
    }

    #[tokio::test]
    async fn attach_moves_created_to_pushed() {
        let ledger = MemoryLedger::new();
        let tx = pushed(&ledger, "ws_CO_01").await;

        assert_eq!(tx.state, TransactionState::Pushed);
        assert_eq!(tx.correlation_id.as_deref(), Some("ws_CO_01"));
        let by_corr = ledger.get_by_correlation("ws_CO_01").await.unwrap().unwrap();
        assert_eq!(by_corr.id, tx.id);
    }

    #[tokio::test]
    async fn attach_twice_is_invalid_transition() {
        let ledger = MemoryLedger::new();
        let tx = pushed(&ledger, "ws_CO_01").await;

        let err = ledger.attach_correlation(&tx.id, "ws_CO_01").await.unwrap_err();
        assert_eq!(err.kind(), "invalid_transition");
    }

    #[tokio::test]
    async fn correlation_ids_are_unique() {
        let ledger = MemoryLedger::new();
        pushed(&ledger, "ws_CO_01").await;
        let other = ledger.create(new_tx(2000)).await.unwrap();

        let err = ledger.attach_correlation(&other.id, "ws_CO_01").await.unwrap_err();
        assert_eq!(err.kind(), "duplicate_correlation");
        let other = ledger.get_by_id(&other.id).await.unwrap().unwrap();
        assert_eq!(other.state, TransactionState::Created);
    }

    #[tokio::test]
    async fn settle_records_receipt_once() {
        let ledger = MemoryLedger::new();
        pushed(&ledger, "ws_CO_01").await;

        let first = ledger
            .settle("ws_CO_01", "QGR7XYZ1", Some(Decimal::from(2000)))
            .await
            .unwrap();
        assert!(first.applied());
        assert_eq!(first.record().state, TransactionState::Settled);
        assert_eq!(first.record().provider_receipt_id.as_deref(), Some("QGR7XYZ1"));

        let second = ledger
            .settle("ws_CO_01", "OTHER", Some(Decimal::from(2000)))
            .await
            .unwrap();
        assert!(!second.applied());
        assert_eq!(second.record().provider_receipt_id.as_deref(), Some("QGR7XYZ1"));
    }

    #[tokio::test]
    async fn amount_mismatch_fails_without_receipt() {
        let ledger = MemoryLedger::new();
        pushed(&ledger, "ws_CO_01").await;

        let outcome = ledger
            .settle("ws_CO_01", "QGR7XYZ1", Some(Decimal::from(20)))
            .await
            .unwrap();
        let tx = outcome.record();
        assert!(outcome.applied());
        assert_eq!(tx.state, TransactionState::Failed);
        assert_eq!(tx.failure_reason.as_deref(), Some(REASON_AMOUNT_MISMATCH));
        assert!(tx.provider_receipt_id.is_none());
    }

    #[tokio::test]
    async fn unknown_correlation_mutates_nothing() {
        let ledger = MemoryLedger::new();
        let tx = pushed(&ledger, "ws_CO_01").await;

        let err = ledger
            .settle("ws_CO_404", "R", Some(Decimal::from(2000)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "unknown_correlation");
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.get_by_id(&tx.id).await.unwrap().unwrap(), tx);
    }

    #[tokio::test]
    async fn terminal_state_ignores_later_failures() {
        let ledger = MemoryLedger::new();
        pushed(&ledger, "ws_CO_01").await;
        ledger
            .settle("ws_CO_01", "QGR7XYZ1", Some(Decimal::from(2000)))
            .await
            .unwrap();

        let outcome = ledger.fail("ws_CO_01", "Request cancelled by user").await.unwrap();
        assert!(!outcome.applied());
        assert_eq!(outcome.record().state, TransactionState::Settled);
        assert!(outcome.record().failure_reason.is_none());
    }

    #[tokio::test]
    async fn fail_initiation_only_from_created() {
        let ledger = MemoryLedger::new();
        let tx = ledger.create(new_tx(2000)).await.unwrap();

        let outcome = ledger.fail_initiation(&tx.id, "rejected").await.unwrap();
        assert!(outcome.applied());
        assert_eq!(outcome.record().state, TransactionState::Failed);
        assert!(outcome.record().correlation_id.is_none());

        let again = ledger.fail_initiation(&tx.id, "rejected").await.unwrap();
        assert!(!again.applied());
    }

    #[tokio::test]
    async fn expire_stale_only_touches_old_pushed_records() {
        let ledger = MemoryLedger::new();
        let old = pushed(&ledger, "ws_CO_01").await;
        let created = ledger.create(new_tx(2000)).await.unwrap();

        let expired = ledger.expire_stale(Utc::now() + chrono::Duration::seconds(1)).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, old.id);
        assert_eq!(expired[0].state, TransactionState::Expired);
        assert!(expired[0].failure_reason.is_none());

        let created = ledger.get_by_id(&created.id).await.unwrap().unwrap();
        assert_eq!(created.state, TransactionState::Created);

        let none = ledger.expire_stale(Utc::now() - chrono::Duration::hours(1)).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_settles_apply_exactly_once() {
        let ledger = Arc::new(MemoryLedger::new());
        pushed(&ledger, "ws_CO_01").await;

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    ledger
                        .settle("ws_CO_01", &format!("R{}", i), Some(Decimal::from(2000)))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut applied = 0;
        let mut receipts = Vec::new();
        for handle in handles {
            let outcome = handle.await.unwrap();
            if outcome.applied() {
                applied += 1;
            }
            receipts.push(outcome.into_record().provider_receipt_id);
        }

        assert_eq!(applied, 1);
        receipts.dedup();
        assert_eq!(receipts.len(), 1, "every caller observes the same terminal record");
    }
}
