// services/mpesa_service.rs
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as base64, Engine as _};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{header, Client, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::MpesaConfig;
use crate::errors::{AppError, Result};

const TOKEN_ATTEMPTS: u32 = 3;
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3599;

/// Outbound side of the push flow.
///
/// Implementations must not retry a push on their own: a blind retry can
/// prompt the payer twice.
#[async_trait]
pub trait PushProvider: Send + Sync {
    async fn push_payment_request(
        &self,
        payer_reference: &str,
        amount: Decimal,
        reference: &str,
        description: &str,
    ) -> Result<PushAccepted>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PushAccepted {
    pub correlation_id: String,
    pub merchant_request_id: String,
    pub response_code: String,
    pub customer_message: String,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    access_token: String,
    // Daraja sends this as a string ("3599").
    #[serde(default)]
    expires_in: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct StkPushRequest {
    #[serde(rename = "BusinessShortCode")]
    pub business_short_code: String,
    #[serde(rename = "Password")]
    pub password: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "TransactionType")]
    pub transaction_type: String,
    #[serde(rename = "Amount")]
    pub amount: String,
    #[serde(rename = "PartyA")]
    pub party_a: String,
    #[serde(rename = "PartyB")]
    pub party_b: String,
    #[serde(rename = "PhoneNumber")]
    pub phone_number: String,
    #[serde(rename = "CallBackURL")]
    pub callback_url: String,
    #[serde(rename = "AccountReference")]
    pub account_reference: String,
    #[serde(rename = "TransactionDesc")]
    pub transaction_desc: String,
}

#[derive(Debug, Deserialize)]
pub struct StkPushResponse {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "ResponseCode")]
    pub response_code: String,
    #[serde(rename = "ResponseDescription", default)]
    pub response_description: String,
    #[serde(rename = "CustomerMessage", default)]
    pub customer_message: String,
}

#[derive(Debug, Deserialize)]
struct ProviderErrorBody {
    #[serde(rename = "errorCode", default)]
    error_code: Option<String>,
    #[serde(rename = "errorMessage", default)]
    error_message: Option<String>,
}

struct CachedToken {
    token: String,
    refresh_after: DateTime<Utc>,
}

/// Daraja client. Owns its HTTP client and bearer-token cache; one instance
/// is shared by every service that needs it.
pub struct MpesaService {
    config: MpesaConfig,
    client: Client,
    cached_token: Mutex<Option<CachedToken>>,
}

impl MpesaService {
    pub fn new(config: MpesaConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| AppError::configuration(format!("failed to create HTTP client: {}", e)))?;

        Ok(MpesaService {
            config,
            client,
            cached_token: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &MpesaConfig {
        &self.config
    }

    fn generate_password(&self, timestamp: &str) -> String {
        let password_string = format!("{}{}{}", self.config.short_code, self.config.passkey, timestamp);
        base64.encode(password_string)
    }

    /// Returns a valid bearer token, refreshing it when the cached one is
    /// about to expire. Concurrent callers share a single refresh.
    pub async fn get_access_token(&self) -> Result<String> {
        let mut cached = self.cached_token.lock().await;

        if let Some(token) = cached.as_ref() {
            if token.refresh_after > Utc::now() {
                debug!("Using cached M-Pesa access token");
                return Ok(token.token.clone());
            }
        }

        let fresh = self.fetch_token_with_retry().await?;
        let token = fresh.token.clone();
        *cached = Some(fresh);
        Ok(token)
    }

    pub async fn invalidate_token(&self) {
        *self.cached_token.lock().await = None;
    }

    async fn fetch_token_with_retry(&self) -> Result<CachedToken> {
        let mut last_error = String::new();

        for attempt in 1..=TOKEN_ATTEMPTS {
            match self.fetch_token().await {
                Ok(token) => return Ok(token),
                Err(TokenError::Rejected(reason)) => return Err(AppError::AuthError(reason)),
                Err(TokenError::Transient(reason)) => {
                    warn!(attempt, error = %reason, "M-Pesa token request failed");
                    last_error = reason;
                    if attempt < TOKEN_ATTEMPTS {
                        tokio::time::sleep(Duration::from_millis(250 * u64::from(attempt))).await;
                    }
                }
            }
        }

        Err(AppError::AuthError(format!(
            "token request failed after {} attempts: {}",
            TOKEN_ATTEMPTS, last_error
        )))
    }

    async fn fetch_token(&self) -> std::result::Result<CachedToken, TokenError> {
        info!("Requesting new M-Pesa access token");
        let credentials = base64.encode(format!(
            "{}:{}",
            self.config.consumer_key, self.config.consumer_secret
        ));

        let response = self
            .client
            .get(self.config.auth_url())
            .header(header::AUTHORIZATION, format!("Basic {}", credentials))
            .send()
            .await
            .map_err(|e| TokenError::Transient(e.to_string()))?;

        let status = response.status();
        // Only bad-request and unauthorized mean the credentials are wrong.
        if matches!(status, StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED) {
            let body = response.text().await.unwrap_or_default();
            error!(%status, body = %body, "M-Pesa rejected client credentials");
            return Err(TokenError::Rejected(format!("credentials rejected: {}", status)));
        }
        if !status.is_success() {
            return Err(TokenError::Transient(format!("token endpoint returned {}", status)));
        }

        let auth: AuthResponse = response
            .json()
            .await
            .map_err(|e| TokenError::Transient(format!("unreadable token response: {}", e)))?;

        let lifetime = auth
            .expires_in
            .as_ref()
            .and_then(|v| match v {
                Value::String(s) => s.trim().parse::<i64>().ok(),
                Value::Number(n) => n.as_i64(),
                _ => None,
            })
            .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);

        info!(lifetime_secs = lifetime, "M-Pesa access token obtained");
        Ok(CachedToken {
            token: auth.access_token,
            refresh_after: Utc::now()
                + ChronoDuration::seconds((lifetime - TOKEN_REFRESH_MARGIN_SECS).max(0)),
        })
    }
}

enum TokenError {
    Rejected(String),
    Transient(String),
}

/// `YYYYMMDDHHmmss` in East Africa Time, as the provider expects.
fn provider_timestamp() -> String {
    (Utc::now() + ChronoDuration::hours(3))
        .format("%Y%m%d%H%M%S")
        .to_string()
}

#[async_trait]
impl PushProvider for MpesaService {
    async fn push_payment_request(
        &self,
        payer_reference: &str,
        amount: Decimal,
        reference: &str,
        description: &str,
    ) -> Result<PushAccepted> {
        info!(payer = %payer_reference, %amount, reference, "C2B: STK push");

        let access_token = self.get_access_token().await?;
        let timestamp = provider_timestamp();
        let password = self.generate_password(&timestamp);

        let stk_request = StkPushRequest {
            business_short_code: self.config.short_code.clone(),
            password,
            timestamp,
            transaction_type: "CustomerPayBillOnline".to_string(),
            amount: amount.trunc().normalize().to_string(),
            party_a: payer_reference.to_string(),
            party_b: self.config.short_code.clone(),
            phone_number: payer_reference.to_string(),
            callback_url: self.config.callback_url.clone(),
            account_reference: reference.to_string(),
            transaction_desc: description.to_string(),
        };

        let response = self
            .client
            .post(self.config.stk_push_url())
            .header(header::AUTHORIZATION, format!("Bearer {}", access_token))
            .json(&stk_request)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "C2B push did not reach M-Pesa");
                AppError::ProviderUnavailable(e.to_string())
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            self.invalidate_token().await;
            return Err(AppError::AuthError("access token rejected by push endpoint".to_string()));
        }
        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            error!(%status, body = %body, "C2B push failed upstream");
            return Err(AppError::ProviderUnavailable(format!("M-Pesa returned {}", status)));
        }
        if !status.is_success() {
            let body: Option<ProviderErrorBody> = response.json().await.ok();
            let (code, message) = body
                .map(|b| (b.error_code, b.error_message))
                .unwrap_or((None, None));
            warn!(%status, code = ?code, message = ?message, "C2B push rejected");
            return Err(AppError::ProviderRejected(
                message.unwrap_or_else(|| format!("M-Pesa returned {}", status)),
            ));
        }

        let stk_response: StkPushResponse = response.json().await.map_err(|e| {
            AppError::ProviderUnavailable(format!("unreadable push acceptance: {}", e))
        })?;

        if stk_response.response_code.trim() != "0" {
            warn!(
                response_code = %stk_response.response_code,
                description = %stk_response.response_description,
                "C2B push not accepted"
            );
            return Err(AppError::ProviderRejected(stk_response.response_description));
        }

        info!(
            merchant_request_id = %stk_response.merchant_request_id,
            checkout_request_id = %stk_response.checkout_request_id,
            "C2B initiated"
        );
        Ok(PushAccepted {
            correlation_id: stk_response.checkout_request_id,
            merchant_request_id: stk_response.merchant_request_id,
            response_code: stk_response.response_code,
            customer_message: stk_response.customer_message,
        })
    }
}
