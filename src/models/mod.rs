pub mod mpesa_callback;
pub mod payment_event;
pub mod payment_transaction;

pub use mpesa_callback::{CallbackResult, ParsedCallback};
pub use payment_event::{PaymentEvent, ReviewFlag, SettlementEvent};
pub use payment_transaction::{
    NewTransaction, PaymentPurpose, PaymentTransaction, TransactionState, TransactionView,
};
