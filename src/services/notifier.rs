// services/notifier.rs
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::models::{PaymentEvent, ReviewFlag, SettlementEvent};

const CHANNEL_CAPACITY: usize = 256;

/// Fan-out of payment outcomes to downstream collaborators
/// (order fulfilment, listing upgrades, review queue).
#[derive(Clone)]
pub struct PaymentNotifier {
    sender: broadcast::Sender<PaymentEvent>,
}

impl Default for PaymentNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl PaymentNotifier {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        PaymentNotifier { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PaymentEvent> {
        self.sender.subscribe()
    }

    pub fn settled(&self, event: SettlementEvent) {
        info!(
            transaction_id = %event.transaction_id,
            subject = %event.subject_reference,
            receipt = %event.provider_receipt_id,
            "payment settled"
        );
        self.publish(PaymentEvent::Settled(event));
    }

    pub fn flag_for_review(&self, flag: ReviewFlag) {
        warn!(
            signal = "manual_review",
            transaction_id = %flag.transaction_id,
            correlation_id = %flag.correlation_id,
            reason = %flag.reason,
            detail = %flag.detail,
            "payment routed to manual review"
        );
        self.publish(PaymentEvent::FlaggedForReview(flag));
    }

    fn publish(&self, event: PaymentEvent) {
        if self.sender.send(event).is_err() {
            debug!("no payment event subscribers");
        }
    }
}

/// Logs every event; attached at startup so outcomes are visible even with
/// no other collaborator subscribed.
pub async fn log_events(mut receiver: broadcast::Receiver<PaymentEvent>) {
    loop {
        match receiver.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => info!(event = %json, "payment event"),
                Err(e) => warn!(error = %e, "unserialisable payment event"),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "payment event log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
