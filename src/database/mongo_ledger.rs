// database/mongo_ledger.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use mongodb::{
    bson::{self, doc, Document},
    error::{ErrorKind, WriteFailure},
    options::{IndexOptions, ReturnDocument},
    Collection, Database, IndexModel,
};
use rust_decimal::Decimal;
use tracing::{debug, info};

use super::ledger::{amount_matches, TransactionLedger, Transition};
use crate::errors::{AppError, Result};
use crate::models::payment_transaction::REASON_AMOUNT_MISMATCH;
use crate::models::{NewTransaction, PaymentTransaction, TransactionState};

pub const COLLECTION: &str = "payment_transactions";

const DUPLICATE_KEY: i32 = 11000;

/// Ledger backed by the `payment_transactions` collection.
///
/// Every transition is a single `find_one_and_update` whose filter includes
/// the expected current state.
#[derive(Clone)]
pub struct MongoLedger {
    db: Database,
    collection: Collection<PaymentTransaction>,
}

impl MongoLedger {
    pub fn new(db: Database) -> Self {
        let collection = db.collection(COLLECTION);
        MongoLedger { db, collection }
    }

    /// Unique on `correlation_id` for the records that have one.
    pub async fn ensure_indexes(&self) -> Result<()> {
        let correlation = IndexModel::builder()
            .keys(doc! { "correlation_id": 1 })
            .options(
                IndexOptions::builder()
                    .unique(true)
                    .sparse(true)
                    .name("correlation_id_unique".to_string())
                    .build(),
            )
            .build();
        let sweep = IndexModel::builder()
            .keys(doc! { "state": 1, "updated_at": 1 })
            .build();

        self.collection
            .create_indexes(vec![correlation, sweep])
            .await?;
        info!(collection = COLLECTION, "ledger indexes ensured");
        Ok(())
    }

    /// Conditional update: applies `set` only while the record matches `filter`.
    async fn compare_and_set(
        &self,
        filter: Document,
        mut set: Document,
    ) -> mongodb::error::Result<Option<PaymentTransaction>> {
        set.insert("updated_at", bson::DateTime::from_chrono(Utc::now()));

        self.collection
            .find_one_and_update(filter, doc! { "$set": set })
            .return_document(ReturnDocument::After)
            .await
    }

    async fn require_by_correlation(&self, correlation_id: &str) -> Result<PaymentTransaction> {
        self.get_by_correlation(correlation_id)
            .await?
            .ok_or_else(|| AppError::UnknownCorrelation(correlation_id.to_string()))
    }

    /// Resolves a lost compare-and-set into the record as it now stands.
    async fn unchanged(&self, correlation_id: &str) -> Result<Transition> {
        let current = self.require_by_correlation(correlation_id).await?;
        debug!(
            correlation_id = %correlation_id,
            state = %current.state,
            "conditional write lost, record unchanged"
        );
        Ok(Transition::Unchanged(current))
    }
}

fn pushed_with_correlation(correlation_id: &str) -> Document {
    doc! {
        "correlation_id": correlation_id,
        "state": TransactionState::Pushed.as_str(),
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(e)) => e.code == DUPLICATE_KEY,
        ErrorKind::Command(e) => e.code == DUPLICATE_KEY,
        _ => false,
    }
}

#[async_trait]
impl TransactionLedger for MongoLedger {
    async fn create(&self, new: NewTransaction) -> Result<PaymentTransaction> {
        let tx = PaymentTransaction::new(new);
        self.collection.insert_one(&tx).await?;
        Ok(tx)
    }

    async fn attach_correlation(
        &self,
        id: &str,
        correlation_id: &str,
    ) -> Result<PaymentTransaction> {
        let filter = doc! { "_id": id, "state": TransactionState::Created.as_str() };
        let set = doc! {
            "correlation_id": correlation_id,
            "state": TransactionState::Pushed.as_str(),
        };

        match self.compare_and_set(filter, set).await {
            Ok(Some(tx)) => Ok(tx),
            Ok(None) => match self.get_by_id(id).await? {
                Some(current) => Err(AppError::InvalidTransition {
                    id: id.to_string(),
                    from: current.state.to_string(),
                    to: TransactionState::Pushed.to_string(),
                }),
                None => Err(AppError::NotFound(id.to_string())),
            },
            Err(e) if is_duplicate_key(&e) => {
                Err(AppError::DuplicateCorrelation(correlation_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn fail_initiation(&self, id: &str, reason: &str) -> Result<Transition> {
        let filter = doc! { "_id": id, "state": TransactionState::Created.as_str() };
        let set = doc! {
            "state": TransactionState::Failed.as_str(),
            "failure_reason": reason,
        };

        if let Some(tx) = self.compare_and_set(filter, set).await? {
            return Ok(Transition::Applied(tx));
        }
        self.get_by_id(id)
            .await?
            .map(Transition::Unchanged)
            .ok_or_else(|| AppError::NotFound(id.to_string()))
    }

    async fn settle(
        &self,
        correlation_id: &str,
        provider_receipt_id: &str,
        confirmed_amount: Option<Decimal>,
    ) -> Result<Transition> {
        // `amount` never changes after creation, so reading it first is safe.
        let current = self.require_by_correlation(correlation_id).await?;
        if current.is_terminal() {
            return Ok(Transition::Unchanged(current));
        }

        let set = if amount_matches(current.amount, confirmed_amount) {
            doc! {
                "state": TransactionState::Settled.as_str(),
                "provider_receipt_id": provider_receipt_id,
            }
        } else {
            doc! {
                "state": TransactionState::Failed.as_str(),
                "failure_reason": REASON_AMOUNT_MISMATCH,
            }
        };

        match self
            .compare_and_set(pushed_with_correlation(correlation_id), set)
            .await?
        {
            Some(tx) => Ok(Transition::Applied(tx)),
            None => self.unchanged(correlation_id).await,
        }
    }

    async fn fail(&self, correlation_id: &str, reason: &str) -> Result<Transition> {
        let set = doc! {
            "state": TransactionState::Failed.as_str(),
            "failure_reason": reason,
        };

        match self
            .compare_and_set(pushed_with_correlation(correlation_id), set)
            .await?
        {
            Some(tx) => Ok(Transition::Applied(tx)),
            None => self.unchanged(correlation_id).await,
        }
    }

    async fn expire_stale(&self, older_than: DateTime<Utc>) -> Result<Vec<PaymentTransaction>> {
        let threshold = bson::DateTime::from_chrono(older_than);
        let stale = doc! {
            "state": TransactionState::Pushed.as_str(),
            "updated_at": { "$lt": threshold },
        };

        let candidates: Vec<PaymentTransaction> =
            self.collection.find(stale.clone()).await?.try_collect().await?;

        let mut expired = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let mut filter = stale.clone();
            filter.insert("_id", candidate.id.as_str());
            let set = doc! { "state": TransactionState::Expired.as_str() };

            // A callback may have settled it since the scan; then this is a no-op.
            if let Some(tx) = self.compare_and_set(filter, set).await? {
                expired.push(tx);
            }
        }
        Ok(expired)
    }

    async fn get_by_correlation(&self, correlation_id: &str) -> Result<Option<PaymentTransaction>> {
        Ok(self
            .collection
            .find_one(doc! { "correlation_id": correlation_id })
            .await?)
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<PaymentTransaction>> {
        Ok(self.collection.find_one(doc! { "_id": id }).await?)
    }

    async fn ping(&self) -> Result<()> {
        self.db.run_command(doc! { "ping": 1 }).await?;
        Ok(())
    }
}
