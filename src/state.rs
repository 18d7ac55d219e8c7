use std::sync::Arc;

use crate::config::AppConfig;
use crate::database::TransactionLedger;
use crate::services::callback_service::CallbackReconciler;
use crate::services::notifier::PaymentNotifier;
use crate::services::payment_service::PaymentService;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub ledger: Arc<dyn TransactionLedger>,
    pub notifier: PaymentNotifier,
    pub reconciler: Arc<CallbackReconciler>,
    // None until M-Pesa credentials are configured
    pub payments: Option<Arc<PaymentService>>,
}

impl AppState {
    pub fn new(config: AppConfig, ledger: Arc<dyn TransactionLedger>) -> Self {
        let notifier = PaymentNotifier::new();
        // Unknown correlations are held as long as a push can stay open.
        let reconciler = Arc::new(CallbackReconciler::new(
            ledger.clone(),
            notifier.clone(),
            config.payment_expiry,
        ));
        AppState {
            config: Arc::new(config),
            ledger,
            notifier,
            reconciler,
            payments: None,
        }
    }

    pub fn with_payments(mut self, payments: Arc<PaymentService>) -> Self {
        self.payments = Some(payments);
        self
    }
}
