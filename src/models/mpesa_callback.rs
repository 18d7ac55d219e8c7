// models/mpesa_callback.rs
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;

use crate::errors::{AppError, Result};

#[derive(Debug, Deserialize)]
pub struct MpesaCallback {
    #[serde(rename = "Body")]
    pub body: CallbackBody,
}

#[derive(Debug, Deserialize)]
pub struct CallbackBody {
    #[serde(rename = "stkCallback")]
    pub stk_callback: StkCallback,
}

#[derive(Debug, Deserialize)]
pub struct StkCallback {
    #[serde(rename = "MerchantRequestID", default)]
    pub merchant_request_id: Option<String>,

    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,

    #[serde(rename = "ResultCode")]
    pub result_code: Value,

    #[serde(rename = "ResultDesc", default)]
    pub result_desc: Option<String>,

    #[serde(rename = "CallbackMetadata", default)]
    pub callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackMetadata {
    #[serde(rename = "Item", default)]
    pub items: Vec<CallbackItem>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackItem {
    #[serde(rename = "Name")]
    pub name: String,

    // Some items (e.g. "Balance") arrive without a value.
    #[serde(rename = "Value", default)]
    pub value: Option<Value>,
}

impl CallbackMetadata {
    fn find(&self, name: &str) -> Option<&Value> {
        self.items
            .iter()
            .find(|item| item.name == name)
            .and_then(|item| item.value.as_ref())
            .filter(|value| !value.is_null())
    }
}

/// Outcome reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackResult {
    Success,
    Failure { code: i64, description: String },
}

/// A structurally valid callback with its metadata read into named fields.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCallback {
    pub correlation_id: String,
    pub merchant_request_id: Option<String>,
    pub result: CallbackResult,
    pub receipt_id: Option<String>,
    pub confirmed_amount: Option<Decimal>,
    pub payer_reference: Option<String>,
    pub transaction_date: Option<String>,
}

impl ParsedCallback {
    pub fn from_slice(raw: &[u8]) -> Result<Self> {
        let callback: MpesaCallback = serde_json::from_slice(raw)?;
        Self::from_callback(callback)
    }

    pub fn from_callback(callback: MpesaCallback) -> Result<Self> {
        let stk = callback.body.stk_callback;

        let correlation_id = stk.checkout_request_id.trim().to_string();
        if correlation_id.is_empty() {
            return Err(AppError::invalid_data("CheckoutRequestID is empty"));
        }

        let code = value_as_i64(&stk.result_code)
            .ok_or_else(|| AppError::invalid_data("ResultCode is not an integer"))?;

        let result = if code == 0 {
            CallbackResult::Success
        } else {
            CallbackResult::Failure {
                code,
                description: stk
                    .result_desc
                    .clone()
                    .filter(|d| !d.trim().is_empty())
                    .unwrap_or_else(|| format!("provider result code {}", code)),
            }
        };

        let metadata = stk.callback_metadata.as_ref();
        let receipt_id = metadata
            .and_then(|m| m.find("MpesaReceiptNumber"))
            .and_then(value_as_string);
        let confirmed_amount = metadata
            .and_then(|m| m.find("Amount"))
            .and_then(value_as_decimal);
        let payer_reference = metadata
            .and_then(|m| m.find("PhoneNumber"))
            .and_then(value_as_string);
        let transaction_date = metadata
            .and_then(|m| m.find("TransactionDate"))
            .and_then(value_as_string);

        Ok(ParsedCallback {
            correlation_id,
            merchant_request_id: stk.merchant_request_id,
            result,
            receipt_id,
            confirmed_amount,
            payer_reference,
            transaction_date,
        })
    }

    pub fn is_success(&self) -> bool {
        self.result == CallbackResult::Success
    }
}

fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_as_string(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn value_as_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(Decimal::from(i))
            } else {
                Decimal::from_str(&n.to_string()).ok()
            }
        }
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}
