// services/payment_service.rs
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use validator::Validate;

use super::mpesa_service::PushProvider;
use super::validation::{normalize_payer_reference, validate_amount};
use crate::database::TransactionLedger;
use crate::errors::{AppError, Result};
use crate::models::{NewTransaction, PaymentPurpose, PaymentTransaction};

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct InitiatePaymentRequest {
    #[validate(length(min = 1, max = 32))]
    pub payer_reference: String,
    pub amount: Decimal,
    pub purpose: PaymentPurpose,
    #[validate(length(min = 1, max = 64))]
    pub subject_reference: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiatedPayment {
    pub transaction_id: String,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub customer_message: String,
}

/// Orchestrates ledger record -> provider push -> correlation.
pub struct PaymentService {
    ledger: Arc<dyn TransactionLedger>,
    provider: Arc<dyn PushProvider>,
}

impl PaymentService {
    pub fn new(ledger: Arc<dyn TransactionLedger>, provider: Arc<dyn PushProvider>) -> Self {
        PaymentService { ledger, provider }
    }

    pub async fn initiate(&self, request: InitiatePaymentRequest) -> Result<InitiatedPayment> {
        let tx = self.open(request).await?;
        self.push(tx).await
    }

    /// Like [`initiate`](Self::initiate), but stops waiting after `wait`.
    ///
    /// The push runs on its own task, so a timeout here never cancels a
    /// prompt that may already be on its way to the payer.
    pub async fn initiate_detached(
        self: Arc<Self>,
        request: InitiatePaymentRequest,
        wait: Duration,
    ) -> Result<InitiatedPayment> {
        let tx = self.open(request).await?;
        let transaction_id = tx.id.clone();

        let service = Arc::clone(&self);
        let handle = tokio::spawn(async move { service.push(tx).await });

        match tokio::time::timeout(wait, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(AppError::internal(format!(
                "initiation task for {} aborted: {}",
                transaction_id, join_error
            ))),
            Err(_) => {
                warn!(
                    transaction_id = %transaction_id,
                    wait_secs = wait.as_secs(),
                    "stopped waiting for push acceptance; push left in flight"
                );
                Err(AppError::InitiationTimeout(format!(
                    "transaction {} is still being submitted; poll its status",
                    transaction_id
                )))
            }
        }
    }

    /// Validates the request and records it in `created`.
    async fn open(&self, request: InitiatePaymentRequest) -> Result<PaymentTransaction> {
        request.validate()?;
        let payer_reference = normalize_payer_reference(&request.payer_reference)?;
        validate_amount(request.purpose, request.amount)?;

        let tx = self
            .ledger
            .create(NewTransaction {
                payer_reference,
                amount: request.amount,
                purpose: request.purpose,
                subject_reference: request.subject_reference.trim().to_string(),
            })
            .await?;

        info!(
            transaction_id = %tx.id,
            purpose = %tx.purpose,
            amount = %tx.amount,
            subject = %tx.subject_reference,
            "payment transaction created"
        );
        Ok(tx)
    }

    async fn push(&self, tx: PaymentTransaction) -> Result<InitiatedPayment> {
        let reference = tx.purpose.account_reference(&tx.subject_reference);
        let description = tx.purpose.description(&tx.subject_reference);

        let accepted = match self
            .provider
            .push_payment_request(&tx.payer_reference, tx.amount, &reference, &description)
            .await
        {
            Ok(accepted) => accepted,
            Err(e) => {
                self.record_push_failure(&tx.id, &e).await;
                return Err(e);
            }
        };

        let pushed = self
            .ledger
            .attach_correlation(&tx.id, &accepted.correlation_id)
            .await
            .map_err(|e| {
                // The prompt is already on the payer's phone; its callback
                // is held as an unknown correlation until the expiry window passes.
                error!(
                    signal = "orphaned_push",
                    transaction_id = %tx.id,
                    correlation_id = %accepted.correlation_id,
                    error = %e,
                    "push accepted but correlation could not be recorded"
                );
                e
            })?;

        info!(
            transaction_id = %pushed.id,
            correlation_id = %accepted.correlation_id,
            "payment pushed to payer"
        );
        Ok(InitiatedPayment {
            transaction_id: pushed.id,
            correlation_id: accepted.correlation_id,
            customer_message: accepted.customer_message,
        })
    }

    async fn record_push_failure(&self, id: &str, cause: &AppError) {
        warn!(
            transaction_id = %id,
            kind = cause.kind(),
            provider_failure = cause.is_provider_failure(),
            error = %cause,
            "payment could not be started"
        );
        let reason = format!("{}: {}", cause.kind(), cause);
        if let Err(e) = self.ledger.fail_initiation(id, &reason).await {
            error!(transaction_id = %id, error = %e, "could not mark unpushed transaction failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemoryLedger;
    use crate::models::TransactionState;
    use crate::services::mpesa_service::PushAccepted;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeProvider {
        reject: Option<fn() -> AppError>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl FakeProvider {
        fn accepting() -> Self {
            FakeProvider { reject: None, delay: Duration::ZERO, calls: AtomicUsize::new(0) }
        }

        fn rejecting(err: fn() -> AppError) -> Self {
            FakeProvider { reject: Some(err), delay: Duration::ZERO, calls: AtomicUsize::new(0) }
        }

        fn slow(delay: Duration) -> Self {
            FakeProvider { reject: None, delay, calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl PushProvider for FakeProvider {
        async fn push_payment_request(
            &self,
            _payer_reference: &str,
            _amount: Decimal,
            _reference: &str,
            _description: &str,
        ) -> Result<PushAccepted> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            match self.reject {
                Some(err) => Err(err()),
                None => Ok(PushAccepted {
                    correlation_id: format!("ws_CO_{:02}", n + 1),
                    merchant_request_id: "29115-1".into(),
                    response_code: "0".into(),
                    customer_message: "Success. Request accepted for processing".into(),
                }),
            }
        }
    }

    fn request(payer: &str, amount: i64, purpose: PaymentPurpose) -> InitiatePaymentRequest {
        InitiatePaymentRequest {
            payer_reference: payer.into(),
            amount: Decimal::from(amount),
            purpose,
            subject_reference: "car:42".into(),
        }
    }

    #[tokio::test]
    async fn accepted_push_leaves_transaction_pushed() {
        let ledger = Arc::new(MemoryLedger::new());
        let service = PaymentService::new(ledger.clone(), Arc::new(FakeProvider::accepting()));

        let initiated = service
            .initiate(request("254712345678", 2000, PaymentPurpose::PremiumUpgrade))
            .await
            .unwrap();
        assert_eq!(initiated.correlation_id, "ws_CO_01");

        let tx = ledger.get_by_id(&initiated.transaction_id).await.unwrap().unwrap();
        assert_eq!(tx.state, TransactionState::Pushed);
        assert_eq!(tx.correlation_id.as_deref(), Some("ws_CO_01"));
        assert_eq!(tx.subject_reference, "car:42");
    }

    #[tokio::test]
    async fn payer_reference_is_stored_normalised() {
        let ledger = Arc::new(MemoryLedger::new());
        let service = PaymentService::new(ledger.clone(), Arc::new(FakeProvider::accepting()));

        let initiated = service
            .initiate(request("0712 345 678", 500, PaymentPurpose::Deposit))
            .await
            .unwrap();
        let tx = ledger.get_by_id(&initiated.transaction_id).await.unwrap().unwrap();
        assert_eq!(tx.payer_reference, "254712345678");
    }

    #[tokio::test]
    async fn rejected_push_fails_transaction_without_correlation() {
        let ledger = Arc::new(MemoryLedger::new());
        let provider = Arc::new(FakeProvider::rejecting(|| {
            AppError::ProviderRejected("Invalid PhoneNumber".into())
        }));
        let service = PaymentService::new(ledger.clone(), provider);

        let tx = service
            .open(request("254712345678", 1500, PaymentPurpose::Deposit))
            .await
            .unwrap();
        let err = service.push(tx.clone()).await.unwrap_err();
        assert_eq!(err.kind(), "provider_rejected");

        let stored = ledger.get_by_id(&tx.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransactionState::Failed);
        assert!(stored.correlation_id.is_none());
        assert!(stored
            .failure_reason
            .as_deref()
            .unwrap_or_default()
            .contains("Invalid PhoneNumber"));
    }

    #[tokio::test]
    async fn provider_faults_fail_transaction_with_their_own_kind() {
        fn auth_fault() -> AppError {
            AppError::AuthError("invalid credentials".into())
        }
        fn network_fault() -> AppError {
            AppError::ProviderUnavailable("timeout".into())
        }
        let cases: [(fn() -> AppError, &str); 2] = [
            (auth_fault, "auth_error"),
            (network_fault, "provider_unavailable"),
        ];

        for (fault, kind) in cases {
            let ledger = Arc::new(MemoryLedger::new());
            let service = PaymentService::new(ledger.clone(), Arc::new(FakeProvider::rejecting(fault)));

            let tx = service
                .open(request("254712345678", 1500, PaymentPurpose::Deposit))
                .await
                .unwrap();
            let err = service.push(tx.clone()).await.unwrap_err();
            assert_eq!(err.kind(), kind);

            let stored = ledger.get_by_id(&tx.id).await.unwrap().unwrap();
            assert_eq!(stored.state, TransactionState::Failed);
            assert!(stored.correlation_id.is_none());
            assert!(stored.failure_reason.as_deref().unwrap_or_default().starts_with(kind));
        }
    }

    #[tokio::test]
    async fn detached_initiation_surfaces_provider_fault() {
        let ledger = Arc::new(MemoryLedger::new());
        let provider =
            Arc::new(FakeProvider::rejecting(|| AppError::ProviderUnavailable("timeout".into())));
        let service = Arc::new(PaymentService::new(ledger.clone(), provider));

        let err = service
            .clone()
            .initiate_detached(
                request("254712345678", 1500, PaymentPurpose::Deposit),
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "provider_unavailable");
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn validation_failures_create_no_record() {
        let ledger = Arc::new(MemoryLedger::new());
        let provider = Arc::new(FakeProvider::accepting());
        let service = PaymentService::new(ledger.clone(), provider.clone());

        let err = service
            .initiate(request("12345", 2000, PaymentPurpose::PremiumUpgrade))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_payer_reference");

        let err = service
            .initiate(request("254712345678", 2100, PaymentPurpose::PremiumUpgrade))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_amount");

        let mut empty_subject = request("254712345678", 100, PaymentPurpose::Deposit);
        empty_subject.subject_reference = String::new();
        let err = service.initiate(empty_subject).await.unwrap_err();
        assert_eq!(err.kind(), "validation_error");

        assert!(ledger.is_empty());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn caller_timeout_leaves_push_in_flight() {
        let ledger = Arc::new(MemoryLedger::new());
        let provider = Arc::new(FakeProvider::slow(Duration::from_millis(200)));
        let service = Arc::new(PaymentService::new(ledger.clone(), provider));

        let err = service
            .clone()
            .initiate_detached(
                request("254712345678", 5000, PaymentPurpose::PremiumUpgrade),
                Duration::from_millis(20),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "initiation_timeout");

        tokio::time::sleep(Duration::from_millis(500)).await;
        let tx = ledger.get_by_correlation("ws_CO_01").await.unwrap().unwrap();
        assert_eq!(tx.state, TransactionState::Pushed);
    }
}
