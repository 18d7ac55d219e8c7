// services/callback_service.rs
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::notifier::PaymentNotifier;
use crate::database::{TransactionLedger, Transition};
use crate::errors::{AppError, Result};
use crate::models::payment_transaction::REASON_MISSING_RECEIPT;
use crate::models::{
    CallbackResult, ParsedCallback, PaymentTransaction, ReviewFlag, SettlementEvent,
    TransactionState,
};

pub const MAX_REDELIVERY_ATTEMPTS: u32 = 5;
pub const MAX_PARKED_CALLBACKS: usize = 1_000;

/// Protocol-level reply to the provider. Says "received", not "agreed".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallbackAck {
    #[serde(rename = "ResultCode")]
    pub result_code: i32,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
}

impl CallbackAck {
    pub fn accepted() -> Self {
        CallbackAck {
            result_code: 0,
            result_desc: "Accepted".to_string(),
        }
    }

    pub fn rejected(reason: impl std::fmt::Display) -> Self {
        CallbackAck {
            result_code: 1,
            result_desc: format!("Rejected: {}", reason),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.result_code == 0
    }
}

/// What the ledger made of one callback.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    Settled(PaymentTransaction),
    Failed(PaymentTransaction),
    AmountMismatch(PaymentTransaction),
    MissingReceipt(PaymentTransaction),
    /// The record was already terminal; nothing changed.
    Duplicate(PaymentTransaction),
    UnknownCorrelation,
}

enum Action<'a> {
    Settle(&'a str),
    MissingReceipt,
    ProviderFailure(&'a str),
}

struct ParkedCallback {
    callback: ParsedCallback,
    attempts: u32,
    first_seen: Instant,
}

impl ParkedCallback {
    fn new(callback: ParsedCallback) -> Self {
        ParkedCallback {
            callback,
            attempts: 1,
            first_seen: Instant::now(),
        }
    }
}

/// Trust boundary between provider callbacks and the ledger.
///
/// Callbacks that cannot be applied yet are parked: those hit by a storage
/// error, and those whose correlation id is not recorded yet (the provider
/// can answer before the push's correlation is stored). The latter are held
/// for `correlation_grace` before being dropped as unknown.
pub struct CallbackReconciler {
    ledger: Arc<dyn TransactionLedger>,
    notifier: PaymentNotifier,
    correlation_grace: Duration,
    parked: Mutex<VecDeque<ParkedCallback>>,
}

impl CallbackReconciler {
    pub fn new(
        ledger: Arc<dyn TransactionLedger>,
        notifier: PaymentNotifier,
        correlation_grace: Duration,
    ) -> Self {
        CallbackReconciler {
            ledger,
            notifier,
            correlation_grace,
            parked: Mutex::new(VecDeque::new()),
        }
    }

    /// Entry point for the callback endpoint.
    pub async fn handle_callback(&self, raw: &[u8]) -> CallbackAck {
        let callback = match ParsedCallback::from_slice(raw) {
            Ok(callback) => callback,
            Err(e) => {
                warn!(signal = "malformed_callback", error = %e, "rejecting malformed M-Pesa callback");
                return CallbackAck::rejected(e);
            }
        };

        info!(
            correlation_id = %callback.correlation_id,
            merchant_request_id = ?callback.merchant_request_id,
            success = callback.is_success(),
            "M-Pesa callback received"
        );

        let outcome = self.reconcile(&callback).await;
        match outcome {
            Ok(Reconciliation::UnknownCorrelation) => {
                info!(
                    correlation_id = %callback.correlation_id,
                    grace_secs = self.correlation_grace.as_secs(),
                    "correlation not recorded yet, holding callback"
                );
                self.park(ParkedCallback::new(callback));
            }
            Ok(_) => {}
            Err(e) => {
                error!(
                    correlation_id = %callback.correlation_id,
                    error = %e,
                    "ledger unavailable, parking callback for redelivery"
                );
                self.park(ParkedCallback::new(callback));
            }
        }

        CallbackAck::accepted()
    }

    /// Applies one parsed callback to the ledger.
    ///
    /// Business outcomes (unknown correlation, duplicates, mismatches) are
    /// `Ok`; only storage failures are `Err`.
    pub async fn reconcile(&self, callback: &ParsedCallback) -> Result<Reconciliation> {
        let correlation_id = callback.correlation_id.as_str();

        let action = match (&callback.result, callback.receipt_id.as_deref()) {
            (CallbackResult::Success, Some(receipt)) => Action::Settle(receipt),
            (CallbackResult::Success, None) => Action::MissingReceipt,
            (CallbackResult::Failure { description, .. }, _) => Action::ProviderFailure(description),
        };

        let written = match &action {
            Action::Settle(receipt) => {
                self.ledger
                    .settle(correlation_id, receipt, callback.confirmed_amount)
                    .await
            }
            Action::MissingReceipt => self.ledger.fail(correlation_id, REASON_MISSING_RECEIPT).await,
            Action::ProviderFailure(reason) => self.ledger.fail(correlation_id, reason).await,
        };

        let transition = match written {
            Ok(transition) => transition,
            Err(AppError::UnknownCorrelation(_)) => {
                debug!(correlation_id = %correlation_id, "no transaction for callback correlation");
                return Ok(Reconciliation::UnknownCorrelation);
            }
            Err(e) => return Err(e),
        };

        let tx = match transition {
            Transition::Unchanged(tx) => {
                info!(
                    transaction_id = %tx.id,
                    correlation_id = %correlation_id,
                    state = %tx.state,
                    "callback for terminal transaction ignored"
                );
                return Ok(Reconciliation::Duplicate(tx));
            }
            Transition::Applied(tx) => tx,
        };

        self.check_payer(&tx, callback);

        let outcome = match (action, tx.state) {
            (Action::Settle(_), TransactionState::Settled) => {
                match SettlementEvent::from_settled(&tx) {
                    Some(event) => self.notifier.settled(event),
                    None => error!(transaction_id = %tx.id, "settled record has no receipt"),
                }
                Reconciliation::Settled(tx)
            }
            (Action::Settle(_), _) => {
                let signal = AppError::AmountMismatch {
                    correlation_id: correlation_id.to_string(),
                    expected: tx.amount.to_string(),
                    confirmed: callback
                        .confirmed_amount
                        .map(|a| a.to_string())
                        .unwrap_or_else(|| "none".to_string()),
                };
                warn!(signal = "amount_mismatch", transaction_id = %tx.id, error = %signal, "callback amount does not match request");
                self.flag(&tx, correlation_id, signal.to_string());
                Reconciliation::AmountMismatch(tx)
            }
            (Action::MissingReceipt, _) => {
                warn!(signal = "missing_receipt", transaction_id = %tx.id, "successful callback without receipt");
                self.flag(&tx, correlation_id, "success result without MpesaReceiptNumber".to_string());
                Reconciliation::MissingReceipt(tx)
            }
            (Action::ProviderFailure(reason), _) => {
                info!(transaction_id = %tx.id, reason, "payment failed at provider");
                Reconciliation::Failed(tx)
            }
        };
        Ok(outcome)
    }

    /// Redelivers parked callbacks. Returns how many were applied.
    pub async fn retry_parked(&self) -> usize {
        let batch: Vec<ParkedCallback> = self.parked_queue().drain(..).collect();
        if batch.is_empty() {
            return 0;
        }

        let mut resolved = 0;
        for mut parked in batch {
            match self.reconcile(&parked.callback).await {
                Ok(Reconciliation::UnknownCorrelation)
                    if parked.first_seen.elapsed() >= self.correlation_grace =>
                {
                    warn!(
                        signal = "unknown_correlation",
                        correlation_id = %parked.callback.correlation_id,
                        payer = ?parked.callback.payer_reference,
                        held_secs = parked.first_seen.elapsed().as_secs(),
                        "callback does not match any transaction; possible spoofed or stale callback"
                    );
                }
                Ok(Reconciliation::UnknownCorrelation) => self.park(parked),
                Ok(_) => resolved += 1,
                Err(e) if parked.attempts + 1 >= MAX_REDELIVERY_ATTEMPTS => {
                    error!(
                        signal = "callback_dropped",
                        correlation_id = %parked.callback.correlation_id,
                        attempts = parked.attempts + 1,
                        error = %e,
                        "giving up on parked callback"
                    );
                }
                Err(e) => {
                    parked.attempts += 1;
                    debug!(correlation_id = %parked.callback.correlation_id, attempts = parked.attempts, error = %e, "parked callback still failing");
                    self.park(parked);
                }
            }
        }
        resolved
    }

    pub fn parked_len(&self) -> usize {
        self.parked_queue().len()
    }

    fn parked_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<ParkedCallback>> {
        self.parked.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn park(&self, parked: ParkedCallback) {
        let mut queue = self.parked_queue();
        if queue.len() >= MAX_PARKED_CALLBACKS {
            error!(
                signal = "callback_dropped",
                correlation_id = %parked.callback.correlation_id,
                capacity = MAX_PARKED_CALLBACKS,
                "callback inbox full, dropping callback"
            );
            return;
        }
        queue.push_back(parked);
    }

    fn flag(&self, tx: &PaymentTransaction, correlation_id: &str, detail: String) {
        self.notifier.flag_for_review(ReviewFlag {
            transaction_id: tx.id.clone(),
            correlation_id: correlation_id.to_string(),
            reason: tx.failure_reason.clone().unwrap_or_default(),
            detail,
        });
    }

    fn check_payer(&self, tx: &PaymentTransaction, callback: &ParsedCallback) {
        if let Some(payer) = callback.payer_reference.as_deref() {
            if payer != tx.payer_reference {
                warn!(
                    signal = "payer_mismatch",
                    transaction_id = %tx.id,
                    expected = %tx.payer_reference,
                    reported = %payer,
                    "callback payer differs from prompted number"
                );
            }
        }
    }
}
