// services/validation.rs
use regex::Regex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::OnceLock;

use crate::errors::{AppError, Result};
use crate::models::PaymentPurpose;

/// Per-transaction ceiling for customer-initiated M-Pesa payments, in KES.
pub const MAX_OPEN_AMOUNT: i64 = 250_000;

fn subscriber_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^254[17][0-9]{8}$").expect("static pattern compiles"))
}

/// Normalises a Kenyan subscriber number to `2547XXXXXXXX` / `2541XXXXXXXX`.
pub fn normalize_payer_reference(raw: &str) -> Result<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();

    let formatted = if let Some(rest) = digits.strip_prefix('0') {
        format!("254{}", rest)
    } else if digits.starts_with('7') || digits.starts_with('1') {
        format!("254{}", digits)
    } else {
        digits
    };

    if subscriber_pattern().is_match(&formatted) {
        Ok(formatted)
    } else {
        Err(AppError::InvalidPayerReference(format!(
            "{:?} is not a valid M-Pesa subscriber number",
            raw
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PremiumTier {
    pub duration: &'static str,
    pub months: u32,
    pub price: i64,
}

pub const PREMIUM_TIERS: [PremiumTier; 3] = [
    PremiumTier { duration: "1month", months: 1, price: 2_000 },
    PremiumTier { duration: "3months", months: 3, price: 5_000 },
    PremiumTier { duration: "12months", months: 12, price: 15_000 },
];

/// Checks `amount` against the pricing rule of `purpose`.
pub fn validate_amount(purpose: PaymentPurpose, amount: Decimal) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(AppError::InvalidAmount("amount must be greater than 0".to_string()));
    }
    if amount.fract() != Decimal::ZERO {
        return Err(AppError::InvalidAmount(
            "M-Pesa only accepts whole shillings".to_string(),
        ));
    }

    match purpose {
        PaymentPurpose::PremiumUpgrade => {
            if PREMIUM_TIERS.iter().any(|tier| Decimal::from(tier.price) == amount) {
                Ok(())
            } else {
                Err(AppError::InvalidAmount(format!(
                    "{} is not a premium tier price (expected one of 2000, 5000, 15000)",
                    amount
                )))
            }
        }
        PaymentPurpose::Deposit | PaymentPurpose::PurchasePayment => {
            if amount > Decimal::from(MAX_OPEN_AMOUNT) {
                Err(AppError::InvalidAmount(format!(
                    "amount exceeds the {} KES per-transaction limit",
                    MAX_OPEN_AMOUNT
                )))
            } else {
                Ok(())
            }
        }
    }
}
