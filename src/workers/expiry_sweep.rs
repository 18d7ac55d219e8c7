use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::database::TransactionLedger;
use crate::errors::{AppError, Result};
use crate::models::PaymentTransaction;

/// Moves `pushed` transactions whose callback never arrived to `expired`.
pub struct ExpirySweepWorker {
    ledger: Arc<dyn TransactionLedger>,
    expiry: Duration,
    interval: Duration,
}

impl ExpirySweepWorker {
    pub fn new(ledger: Arc<dyn TransactionLedger>, expiry: Duration, interval: Duration) -> Self {
        Self {
            ledger,
            expiry,
            interval,
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            expiry_secs = self.expiry.as_secs(),
            interval_secs = self.interval.as_secs(),
            "payment expiry sweep started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("payment expiry sweep stopping");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.sweep_once().await {
                        error!(error = %e, "expiry sweep cycle failed");
                    }
                }
            }
        }

        info!("payment expiry sweep stopped");
    }

    pub async fn sweep_once(&self) -> Result<Vec<PaymentTransaction>> {
        let window = chrono::Duration::from_std(self.expiry)
            .map_err(|e| AppError::configuration(format!("payment expiry out of range: {}", e)))?;
        let expired = self.ledger.expire_stale(Utc::now() - window).await?;

        for tx in &expired {
            warn!(
                signal = "payment_expired",
                transaction_id = %tx.id,
                correlation_id = ?tx.correlation_id,
                amount = %tx.amount,
                "no callback received before expiry"
            );
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired stale payments");
        }
        Ok(expired)
    }
}
