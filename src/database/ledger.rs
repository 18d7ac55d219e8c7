// database/ledger.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::errors::Result;
use crate::models::{NewTransaction, PaymentTransaction};

/// Result of a conditional write.
///
/// `Applied` means this call performed the transition; `Unchanged` means the
/// record was already past the expected state and is returned as stored.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Applied(PaymentTransaction),
    Unchanged(PaymentTransaction),
}

impl Transition {
    pub fn applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }

    pub fn record(&self) -> &PaymentTransaction {
        match self {
            Transition::Applied(tx) | Transition::Unchanged(tx) => tx,
        }
    }

    pub fn into_record(self) -> PaymentTransaction {
        match self {
            Transition::Applied(tx) | Transition::Unchanged(tx) => tx,
        }
    }
}

/// Durable record of every payment attempt.
///
/// Every write is a compare-and-swap on the current state: racing writers
/// collapse to one effective transition and the losers get `Unchanged`.
#[async_trait]
pub trait TransactionLedger: Send + Sync {
    async fn create(&self, new: NewTransaction) -> Result<PaymentTransaction>;

    /// `created -> pushed`. Fails with `InvalidTransition` from any other state.
    async fn attach_correlation(&self, id: &str, correlation_id: &str)
        -> Result<PaymentTransaction>;

    /// `created -> failed`, used when the provider never accepted the push.
    async fn fail_initiation(&self, id: &str, reason: &str) -> Result<Transition>;

    /// `pushed -> settled`, or `pushed -> failed` with `amount-mismatch` when
    /// the confirmed amount differs from the requested one.
    async fn settle(
        &self,
        correlation_id: &str,
        provider_receipt_id: &str,
        confirmed_amount: Option<Decimal>,
    ) -> Result<Transition>;

    /// `pushed -> failed`.
    async fn fail(&self, correlation_id: &str, reason: &str) -> Result<Transition>;

    /// `pushed -> expired` for every record not updated since `older_than`.
    /// Returns the records this call expired.
    async fn expire_stale(&self, older_than: DateTime<Utc>) -> Result<Vec<PaymentTransaction>>;

    async fn get_by_correlation(&self, correlation_id: &str) -> Result<Option<PaymentTransaction>>;

    async fn get_by_id(&self, id: &str) -> Result<Option<PaymentTransaction>>;

    /// Cheap connectivity check for health checks.
    async fn ping(&self) -> Result<()>;
}

/// Amounts match when equal in value, regardless of scale.
pub(crate) fn amount_matches(expected: Decimal, confirmed: Option<Decimal>) -> bool {
    confirmed.map_or(false, |c| c == expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_matching_ignores_scale() {
        assert!(amount_matches(Decimal::from(2000), Some(Decimal::new(200000, 2))));
        assert!(!amount_matches(Decimal::from(2000), Some(Decimal::from(1999))));
        assert!(!amount_matches(Decimal::from(2000), None));
    }
}
