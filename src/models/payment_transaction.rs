// models/payment_transaction.rs
use chrono::{DateTime, Utc};
use mongodb::bson;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const REASON_AMOUNT_MISMATCH: &str = "amount-mismatch";
pub const REASON_MISSING_RECEIPT: &str = "missing-receipt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionState {
    Created,
    Pushed,
    Settled,
    Failed,
    Expired,
}

impl TransactionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Created => "created",
            TransactionState::Pushed => "pushed",
            TransactionState::Settled => "settled",
            TransactionState::Failed => "failed",
            TransactionState::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Settled | TransactionState::Failed | TransactionState::Expired
        )
    }

    /// The edges of the payment state machine.
    pub fn can_transition_to(&self, next: TransactionState) -> bool {
        use TransactionState::*;
        matches!(
            (self, next),
            (Created, Pushed) | (Created, Failed) | (Pushed, Settled) | (Pushed, Failed) | (Pushed, Expired)
        )
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the payer is paying for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PaymentPurpose {
    Deposit,
    PremiumUpgrade,
    PurchasePayment,
}

impl PaymentPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentPurpose::Deposit => "deposit",
            PaymentPurpose::PremiumUpgrade => "premium-upgrade",
            PaymentPurpose::PurchasePayment => "purchase-payment",
        }
    }

    /// `AccountReference` shown on the payer's prompt. The provider caps it at 12 characters.
    pub fn account_reference(&self, subject_reference: &str) -> String {
        let prefix = match self {
            PaymentPurpose::Deposit => "CAR",
            PaymentPurpose::PremiumUpgrade => "PREMIUM",
            PaymentPurpose::PurchasePayment => "PAYMENT",
        };
        let subject = subject_reference
            .rsplit(':')
            .next()
            .unwrap_or(subject_reference);
        format!("{}-{}", prefix, subject).chars().take(12).collect()
    }

    pub fn description(&self, subject_reference: &str) -> String {
        match self {
            PaymentPurpose::Deposit => format!("Car deposit for listing {}", subject_reference),
            PaymentPurpose::PremiumUpgrade => {
                format!("Premium seller upgrade for {}", subject_reference)
            }
            PaymentPurpose::PurchasePayment => {
                format!("Car purchase payment for listing {}", subject_reference)
            }
        }
    }
}

impl fmt::Display for PaymentPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentTransaction {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub payer_reference: String,
    pub amount: Decimal,
    pub purpose: PaymentPurpose,
    pub subject_reference: String,
    pub state: TransactionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_receipt_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,

    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl PaymentTransaction {
    pub fn new(new: NewTransaction) -> Self {
        let now = Utc::now();
        PaymentTransaction {
            id: uuid::Uuid::new_v4().to_string(),
            correlation_id: None,
            payer_reference: new.payer_reference,
            amount: new.amount,
            purpose: new.purpose,
            subject_reference: new.subject_reference,
            state: TransactionState::Created,
            provider_receipt_id: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub payer_reference: String,
    pub amount: Decimal,
    pub purpose: PaymentPurpose,
    pub subject_reference: String,
}

/// Camel-cased view returned to API consumers.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionView {
    pub transaction_id: String,
    pub correlation_id: Option<String>,
    pub payer_reference: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub purpose: PaymentPurpose,
    pub subject_reference: String,
    pub state: TransactionState,
    pub provider_receipt_id: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<PaymentTransaction> for TransactionView {
    fn from(tx: PaymentTransaction) -> Self {
        TransactionView {
            transaction_id: tx.id,
            correlation_id: tx.correlation_id,
            payer_reference: tx.payer_reference,
            amount: tx.amount,
            purpose: tx.purpose,
            subject_reference: tx.subject_reference,
            state: tx.state,
            provider_receipt_id: tx.provider_receipt_id,
            failure_reason: tx.failure_reason,
            created_at: tx.created_at,
            updated_at: tx.updated_at,
        }
    }
}
