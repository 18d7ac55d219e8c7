// handlers/mpesa_handlers.rs
use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info};

use crate::errors::{AppError, Result};
use crate::models::{PaymentPurpose, TransactionView};
use crate::services::payment_service::{InitiatePaymentRequest, InitiatedPayment};
use crate::services::validation::{MAX_OPEN_AMOUNT, PREMIUM_TIERS};
use crate::state::AppState;

// C2B Response
#[derive(Debug, Serialize)]
pub struct StkPushResponse {
    pub success: bool,
    #[serde(flatten)]
    pub payment: InitiatedPayment,
}

// Status Query
#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub transaction_id: Option<String>,
    pub checkout_request_id: Option<String>,
}

// POST /api/mpesa/stk-push
pub async fn initiate_stk_push(
    State(state): State<AppState>,
    payload: std::result::Result<Json<InitiatePaymentRequest>, JsonRejection>,
) -> Result<Json<StkPushResponse>> {
    let Json(request) = payload.map_err(|e| AppError::ValidationError(e.body_text()))?;

    let payments = state.payments.clone().ok_or_else(|| {
        error!("M-Pesa service not available");
        AppError::ServiceUnavailable("M-Pesa payments are not configured".to_string())
    })?;

    info!(
        purpose = %request.purpose,
        subject = %request.subject_reference,
        amount = %request.amount,
        "Received STK push request"
    );

    let payment = payments
        .initiate_detached(request, state.config.initiate_timeout)
        .await?;

    Ok(Json(StkPushResponse {
        success: true,
        payment,
    }))
}

// POST /api/mpesa/callback
pub async fn mpesa_callback(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let ack = state.reconciler.handle_callback(&body).await;
    let status = if ack.is_accepted() {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, Json(ack))
}

// GET /api/mpesa/transactions/:id
pub async fn get_transaction(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TransactionView>> {
    let tx = state
        .ledger
        .get_by_id(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("transaction {} not found", id)))?;
    Ok(Json(tx.into()))
}

// GET /api/mpesa/status
pub async fn check_transaction_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<Value>> {
    let found = match (&query.transaction_id, &query.checkout_request_id) {
        (Some(id), _) => state.ledger.get_by_id(id).await?,
        (None, Some(checkout_request_id)) => {
            state.ledger.get_by_correlation(checkout_request_id).await?
        }
        (None, None) => {
            return Err(AppError::invalid_data(
                "transaction_id or checkout_request_id is required",
            ))
        }
    };

    let tx = found.ok_or_else(|| AppError::NotFound("transaction not found".to_string()))?;
    Ok(Json(json!({
        "success": true,
        "status": tx.state,
        "terminal": tx.is_terminal(),
        "transaction": TransactionView::from(tx),
    })))
}

// GET /api/mpesa/pricing
pub async fn get_pricing() -> Json<Value> {
    Json(json!({
        "currency": "KES",
        "premium": PREMIUM_TIERS,
        "openAmount": { "min": 1, "max": MAX_OPEN_AMOUNT },
        "purposes": [
            PaymentPurpose::Deposit,
            PaymentPurpose::PremiumUpgrade,
            PaymentPurpose::PurchasePayment,
        ],
    }))
}

// GET /api/mpesa/health
pub async fn mpesa_health(State(state): State<AppState>) -> Json<Value> {
    let ledger = match state.ledger.ping().await {
        Ok(()) => "connected",
        Err(_) => "disconnected",
    };

    Json(json!({
        "status": "ok",
        "service": "mpesa",
        "ledger": ledger,
        "initiation": state.payments.is_some(),
        "environment": state.config.mpesa.as_ref().map(|m| m.environment.as_str()),
        "parkedCallbacks": state.reconciler.parked_len(),
        "timestamp": Utc::now().to_rfc3339(),
        "features": ["stk-push", "callback", "status", "pricing", "expiry-sweep"]
    }))
}
