use axum::{
    routing::{get, post},
    Router,
};

use crate::handlers::mpesa_handlers;
use crate::state::AppState;

pub fn mpesa_routes() -> Router<AppState> {
    Router::new()
        // Health
        .route("/health", get(mpesa_handlers::mpesa_health))

        // C2B Routes
        .route("/stk-push", post(mpesa_handlers::initiate_stk_push))
        .route("/callback", post(mpesa_handlers::mpesa_callback))

        // Status
        .route("/transactions/:id", get(mpesa_handlers::get_transaction))
        .route("/status", get(mpesa_handlers::check_transaction_status))
        .route("/pricing", get(mpesa_handlers::get_pricing))
}
