pub mod callback_retry;
pub mod expiry_sweep;
