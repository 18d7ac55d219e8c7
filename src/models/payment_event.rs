// models/payment_event.rs
use rust_decimal::Decimal;
use serde::Serialize;

use super::payment_transaction::{PaymentPurpose, PaymentTransaction};

/// Emitted exactly once per transaction that reaches `settled`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementEvent {
    pub transaction_id: String,
    pub subject_reference: String,
    pub purpose: PaymentPurpose,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub provider_receipt_id: String,
}

impl SettlementEvent {
    /// `None` unless the record carries a receipt, i.e. it is settled.
    pub fn from_settled(tx: &PaymentTransaction) -> Option<Self> {
        tx.provider_receipt_id.as_ref().map(|receipt| SettlementEvent {
            transaction_id: tx.id.clone(),
            subject_reference: tx.subject_reference.clone(),
            purpose: tx.purpose,
            amount: tx.amount,
            provider_receipt_id: receipt.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewFlag {
    pub transaction_id: String,
    pub correlation_id: String,
    pub reason: String,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentEvent {
    Settled(SettlementEvent),
    FlaggedForReview(ReviewFlag),
}
