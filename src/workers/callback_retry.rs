use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use crate::services::callback_service::CallbackReconciler;

pub struct CallbackRetryWorker {
    reconciler: Arc<CallbackReconciler>,
    interval: Duration,
}

impl CallbackRetryWorker {
    pub fn new(reconciler: Arc<CallbackReconciler>, interval: Duration) -> Self {
        Self {
            reconciler,
            interval,
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "callback retry worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("callback retry worker stopping");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.interval) => {
                    let resolved = self.reconciler.retry_parked().await;
                    if resolved > 0 {
                        info!(resolved, pending = self.reconciler.parked_len(), "redelivered parked callbacks");
                    }
                }
            }
        }

        info!("callback retry worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemoryLedger;
    use crate::services::notifier::PaymentNotifier;

    #[tokio::test]
    async fn stops_when_shutdown_is_signalled() {
        let reconciler = Arc::new(CallbackReconciler::new(
            Arc::new(MemoryLedger::new()),
            PaymentNotifier::new(),
            Duration::ZERO,
        ));
        let worker = CallbackRetryWorker::new(reconciler, Duration::from_millis(10));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
