pub mod connection;
pub mod ledger;
pub mod memory_ledger;
pub mod mongo_ledger;

pub use ledger::{TransactionLedger, Transition};
pub use memory_ledger::MemoryLedger;
pub use mongo_ledger::MongoLedger;
