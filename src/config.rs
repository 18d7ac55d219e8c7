// config.rs
use std::env;
use std::time::Duration;

use crate::errors::{AppError, Result};

pub const CALLBACK_PATH: &str = "/api/mpesa/callback";

const SANDBOX_BASE_URL: &str = "https://sandbox.safaricom.co.ke";
const PRODUCTION_BASE_URL: &str = "https://api.safaricom.co.ke";

/// Credentials and endpoints for the M-Pesa Daraja API.
#[derive(Debug, Clone)]
pub struct MpesaConfig {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub short_code: String,
    pub passkey: String,
    pub environment: String,
    pub base_url: String,
    pub callback_url: String,
    pub request_timeout: Duration,
}

impl MpesaConfig {
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    pub fn auth_url(&self) -> String {
        format!("{}/oauth/v1/generate?grant_type=client_credentials", self.base_url)
    }

    pub fn stk_push_url(&self) -> String {
        format!("{}/mpesa/stkpush/v1/processrequest", self.base_url)
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// `None` when the provider credentials are not configured.
    pub mpesa: Option<MpesaConfig>,
    pub database_url: Option<String>,
    pub database_name: String,
    pub port: u16,
    pub host: String,
    pub payment_expiry: Duration,
    pub sweep_interval: Duration,
    pub initiate_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary key source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let request_timeout =
            Duration::from_secs(parse_or(&get, "PROVIDER_TIMEOUT_SECONDS", 30)?);
        let mpesa = match mpesa_from_lookup(&get, request_timeout) {
            Ok(mpesa) => Some(mpesa),
            Err(e) => {
                tracing::warn!(error = %e, "M-Pesa configuration incomplete, initiation disabled");
                None
            }
        };

        Ok(AppConfig {
            mpesa,
            database_url: get("DATABASE_URL"),
            database_name: get("DATABASE_NAME").unwrap_or_else(|| "carmarket".to_string()),
            port: parse_or(&get, "PORT", 10000)?,
            host: get("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            payment_expiry: Duration::from_secs(parse_or(&get, "PAYMENT_EXPIRY_SECONDS", 300)?),
            sweep_interval: Duration::from_secs(parse_or(
                &get,
                "EXPIRY_SWEEP_INTERVAL_SECONDS",
                60,
            )?),
            initiate_timeout: Duration::from_secs(parse_or(&get, "INITIATE_TIMEOUT_SECONDS", 40)?),
        })
    }

    pub fn get_config_info(&self) -> serde_json::Value {
        serde_json::json!({
            "mpesa_enabled": self.mpesa.is_some(),
            "environment": self.mpesa.as_ref().map(|m| m.environment.clone()),
            "business_shortcode": self.mpesa.as_ref().map(|m| m.short_code.clone()),
            "callback_url": self.mpesa.as_ref().map(|m| m.callback_url.clone()),
            "ledger": if self.database_url.is_some() { "mongodb" } else { "memory" },
            "payment_expiry_secs": self.payment_expiry.as_secs(),
            "port": self.port,
            "host": self.host,
        })
    }
}

/// Missing credentials are an `Err` here; malformed numbers are checked by the caller.
fn mpesa_from_lookup<G>(get: &G, request_timeout: Duration) -> Result<MpesaConfig>
where
    G: Fn(&str) -> Option<String>,
{
    let required = |key: &str| {
        get(key).ok_or_else(|| AppError::configuration(format!("{} must be set", key)))
    };

    let environment = get("MPESA_ENVIRONMENT").unwrap_or_else(|| "sandbox".to_string());
    let base_url = get("MPESA_BASE_URL").unwrap_or_else(|| {
        if environment == "production" {
            PRODUCTION_BASE_URL.to_string()
        } else {
            SANDBOX_BASE_URL.to_string()
        }
    });
    let callback_base = required("CALLBACK_BASE_URL")?;

    Ok(MpesaConfig {
        consumer_key: required("MPESA_CONSUMER_KEY")?,
        consumer_secret: required("MPESA_CONSUMER_SECRET")?,
        short_code: required("MPESA_SHORT_CODE")?,
        passkey: required("MPESA_PASSKEY")?,
        environment,
        base_url: base_url.trim_end_matches('/').to_string(),
        callback_url: format!("{}{}", callback_base.trim_end_matches('/'), CALLBACK_PATH),
        request_timeout,
    })
}

fn parse_or<G, T>(get: &G, key: &str, default: T) -> Result<T>
where
    G: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::configuration(format!("{} must be a number, got {:?}", key, raw))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const FULL: &[(&str, &str)] = &[
        ("MPESA_CONSUMER_KEY", "key"),
        ("MPESA_CONSUMER_SECRET", "secret"),
        ("MPESA_SHORT_CODE", "174379"),
        ("MPESA_PASSKEY", "passkey"),
        ("CALLBACK_BASE_URL", "https://cars.example.com/"),
    ];

    #[test]
    fn defaults_apply_when_optional_keys_are_missing() {
        let config = AppConfig::from_lookup(lookup(FULL)).unwrap();
        let mpesa = config.mpesa.unwrap();

        assert_eq!(mpesa.base_url, SANDBOX_BASE_URL);
        assert_eq!(mpesa.callback_url, "https://cars.example.com/api/mpesa/callback");
        assert_eq!(config.port, 10000);
        assert_eq!(config.payment_expiry, Duration::from_secs(300));
        assert!(config.database_url.is_none());
    }

    #[test]
    fn production_environment_switches_base_url() {
        let mut pairs = FULL.to_vec();
        pairs.push(("MPESA_ENVIRONMENT", "production"));
        let mpesa = AppConfig::from_lookup(lookup(&pairs)).unwrap().mpesa.unwrap();

        assert!(mpesa.is_production());
        assert_eq!(
            mpesa.stk_push_url(),
            "https://api.safaricom.co.ke/mpesa/stkpush/v1/processrequest"
        );
    }

    #[test]
    fn missing_credentials_disable_mpesa_only() {
        let config = AppConfig::from_lookup(lookup(&[("PORT", "8080")])).unwrap();
        assert!(config.mpesa.is_none());
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let err = AppConfig::from_lookup(lookup(&[("PORT", "eighty")])).unwrap_err();
        assert_eq!(err.kind(), "configuration_error");
    }

    #[test]
    fn malformed_provider_timeout_is_an_error_not_a_disabled_provider() {
        let mut pairs = FULL.to_vec();
        pairs.push(("PROVIDER_TIMEOUT_SECONDS", "thirty"));
        let err = AppConfig::from_lookup(lookup(&pairs)).unwrap_err();
        assert_eq!(err.kind(), "configuration_error");

        pairs.pop();
        pairs.push(("PROVIDER_TIMEOUT_SECONDS", "5"));
        let mpesa = AppConfig::from_lookup(lookup(&pairs)).unwrap().mpesa.unwrap();
        assert_eq!(mpesa.request_timeout, Duration::from_secs(5));
    }
}
