use crate::handlers::common::{success_response, validate_input};
use crate::{errors::ServiceError, services::payment_gateway::InitiateRequest, AppState};
use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use validator::Validate;

/// Creates the router for payment endpoints
pub fn payments_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/initialize", post(initialize_payment))
        .route("/verify/:reference", get(verify_payment))
}

#[derive(Debug, Deserialize, Validate)]
struct InitializeRequest {
    #[validate(email)]
    email: String,
    amount: Decimal,
    #[serde(default)]
    metadata: Option<Value>,
}

/// Create a payment intent at the gateway
async fn initialize_payment(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<InitializeRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;

    let initiated = state
        .services
        .gateway
        .initiate(InitiateRequest {
            email: payload.email,
            amount: payload.amount,
            callback_url: state.config.gateway.callback_url.clone(),
            metadata: payload.metadata,
        })
        .await?;

    Ok(success_response(initiated))
}

/// Verify a gateway reference
async fn verify_payment(
    State(state): State<Arc<AppState>>,
    Path(reference): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let outcome = state.services.gateway.verify(&reference).await?;
    Ok(success_response(outcome))
}
