// src/errors.rs
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    // Caller input
    #[error("Invalid payer reference: {0}")]
    InvalidPayerReference(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    // Provider integration
    #[error("M-Pesa authentication failed: {0}")]
    AuthError(String),

    #[error("M-Pesa rejected the request: {0}")]
    ProviderRejected(String),

    #[error("M-Pesa unavailable: {0}")]
    ProviderUnavailable(String),

    // Callback integrity
    #[error("Unknown correlation id: {0}")]
    UnknownCorrelation(String),

    #[error("Amount mismatch for {correlation_id}: expected {expected}, confirmed {confirmed}")]
    AmountMismatch {
        correlation_id: String,
        expected: String,
        confirmed: String,
    },

    // Ledger invariants
    #[error("Invalid transition for transaction {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },

    #[error("Correlation id already assigned: {0}")]
    DuplicateCorrelation(String),

    #[error("Transaction not found: {0}")]
    NotFound(String),

    // Infrastructure
    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Initiation still in flight: {0}")]
    InitiationTimeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable discriminator exposed to API consumers.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::InvalidPayerReference(_) => "invalid_payer_reference",
            AppError::InvalidAmount(_) => "invalid_amount",
            AppError::ValidationError(_) => "validation_error",
            AppError::AuthError(_) => "auth_error",
            AppError::ProviderRejected(_) => "provider_rejected",
            AppError::ProviderUnavailable(_) => "provider_unavailable",
            AppError::UnknownCorrelation(_) => "unknown_correlation",
            AppError::AmountMismatch { .. } => "amount_mismatch",
            AppError::InvalidTransition { .. } => "invalid_transition",
            AppError::DuplicateCorrelation(_) => "duplicate_correlation",
            AppError::NotFound(_) => "not_found",
            AppError::Database(_) => "database_error",
            AppError::ConfigurationError(_) => "configuration_error",
            AppError::ServiceUnavailable(_) => "service_unavailable",
            AppError::InitiationTimeout(_) => "initiation_timeout",
            AppError::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidPayerReference(_)
            | AppError::InvalidAmount(_)
            | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::AuthError(_) | AppError::ProviderRejected(_) => StatusCode::BAD_GATEWAY,
            AppError::ProviderUnavailable(_) | AppError::ServiceUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::NotFound(_) | AppError::UnknownCorrelation(_) => StatusCode::NOT_FOUND,
            AppError::InvalidTransition { .. } | AppError::DuplicateCorrelation(_) => {
                StatusCode::CONFLICT
            }
            AppError::AmountMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::InitiationTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Database(_) | AppError::ConfigurationError(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Errors raised while talking to the provider during initiation.
    pub fn is_provider_failure(&self) -> bool {
        matches!(
            self,
            AppError::AuthError(_) | AppError::ProviderRejected(_) | AppError::ProviderUnavailable(_)
        )
    }

    pub fn invalid_data(msg: impl Into<String>) -> Self {
        AppError::ValidationError(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        AppError::ConfigurationError(msg.into())
    }

    pub fn database(msg: impl Into<String>) -> Self {
        AppError::Database(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        AppError::Internal(msg.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Storage details stay in the logs.
        let message = match &self {
            AppError::Database(_) | AppError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };

        let body = Json(json!({
            "kind": self.kind(),
            "message": message,
            "success": false,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }));

        (status, body).into_response()
    }
}

impl From<mongodb::error::Error> for AppError {
    fn from(err: mongodb::error::Error) -> Self {
        AppError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::ValidationError(format!("JSON parsing error: {}", err))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::ProviderUnavailable(format!("HTTP request failed: {}", err))
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::ValidationError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_snake_case() {
        assert_eq!(AppError::InvalidAmount("x".into()).kind(), "invalid_amount");
        assert_eq!(
            AppError::InvalidPayerReference("x".into()).kind(),
            "invalid_payer_reference"
        );
        assert_eq!(AppError::ProviderRejected("x".into()).kind(), "provider_rejected");
    }

    #[test]
    fn caller_errors_map_to_bad_request() {
        assert_eq!(
            AppError::InvalidAmount("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::ProviderUnavailable("down".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn provider_failures_are_classified() {
        assert!(AppError::AuthError("x".into()).is_provider_failure());
        assert!(AppError::ProviderUnavailable("x".into()).is_provider_failure());
        assert!(!AppError::InvalidAmount("x".into()).is_provider_failure());
    }
}
