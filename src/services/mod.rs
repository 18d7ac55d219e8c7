pub mod callback_service;
pub mod mpesa_service;
pub mod notifier;
pub mod payment_service;
pub mod validation;
