use crate::{
    entities::{order::OrderStatus, payment::PaymentMethod},
    services::orders::{CreateOrderInput, OrderLineInput},
    AppState,
};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Router,
};
use bytes::Bytes;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha512;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

type HmacSha512 = Hmac<Sha512>;

const SIGNATURE_HEADER: &str = "x-gateway-signature";

/// Creates the router for gateway webhook endpoints
pub fn webhooks_routes() -> Router<Arc<AppState>> {
    Router::new().route("/webhook", post(payment_webhook))
}

/// Gateway webhook receiver.
///
/// Always answers 200 so the gateway stops retrying; a bad signature or a
/// failed order placement is logged and dropped, never surfaced. The
/// gateway is not a client we can return errors to.
async fn payment_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if !verify_signature(state.config.gateway.webhook_secret(), &body, signature) {
        warn!("webhook signature verification failed, dropping event");
        return StatusCode::OK;
    }

    let event: Value = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            warn!("webhook payload is not valid JSON: {}", e);
            return StatusCode::OK;
        }
    };

    let event_type = event.get("event").and_then(Value::as_str).unwrap_or("");
    match event_type {
        "charge.success" => {
            if let Err(e) = place_order_from_event(&state, &event).await {
                error!("failed to place order from webhook: {}", e);
            }
        }
        other => {
            info!("unhandled gateway event type: {}", other);
        }
    }

    StatusCode::OK
}

/// HMAC-SHA512 over the raw body, hex-encoded, compared in constant time.
fn verify_signature(secret: &str, payload: &Bytes, signature: &str) -> bool {
    let Ok(mut mac) = HmacSha512::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    let expected = hex::encode(mac.finalize().into_bytes());
    constant_time_eq(&expected, signature)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Places the order a successful charge pays for. The checkout metadata
/// attached at initialization names the user, cart and shipping address.
async fn place_order_from_event(state: &AppState, event: &Value) -> Result<(), String> {
    let data = event.get("data").ok_or("event has no data")?;
    let reference = data
        .get("reference")
        .and_then(Value::as_str)
        .ok_or("event has no reference")?;
    let metadata = data.get("metadata").ok_or("event has no metadata")?;

    let user_id = parse_uuid(metadata, "user_id")?;
    let cart_id = parse_uuid(metadata, "cart_id")?;
    let shipping_address = metadata
        .get("shipping_address")
        .and_then(Value::as_str)
        .ok_or("metadata has no shipping_address")?
        .to_string();
    let payment_method = metadata
        .get("payment_method")
        .and_then(|v| serde_json::from_value::<PaymentMethod>(v.clone()).ok())
        .unwrap_or(PaymentMethod::Card);

    let resolved = state
        .services
        .carts
        .get_cart(cart_id)
        .await
        .map_err(|e| format!("cart lookup failed: {}", e))?;

    let items = resolved
        .items
        .iter()
        .map(|item| OrderLineInput {
            product_id: item.product_id,
            quantity: item.quantity,
        })
        .collect();

    let placed = state
        .services
        .orders
        .create_order(CreateOrderInput {
            user_id,
            items,
            shipping_address,
            payment_method,
            transaction_id: Some(reference.to_string()),
        })
        .await
        .map_err(|e| format!("order placement failed: {}", e))?;

    if placed.order.status != OrderStatus::Cancelled {
        state
            .services
            .carts
            .clear(cart_id)
            .await
            .map_err(|e| format!("cart clear failed: {}", e))?;
    }

    info!(
        order_id = %placed.order.id,
        reference = %reference,
        "order placed from gateway webhook"
    );
    Ok(())
}

fn parse_uuid(metadata: &Value, key: &str) -> Result<Uuid, String> {
    metadata
        .get(key)
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| format!("metadata has no valid {}", key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, payload: &[u8]) -> String {
        let mut mac = HmacSha512::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn valid_signature_is_accepted() {
        let body = Bytes::from_static(b"{\"event\":\"charge.success\"}");
        let signature = sign("whsec_test", &body);
        assert!(verify_signature("whsec_test", &body, &signature));
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let body = Bytes::from_static(b"{\"event\":\"charge.success\"}");
        let signature = sign("whsec_test", &body);
        let tampered = Bytes::from_static(b"{\"event\":\"charge.failed\"}");
        assert!(!verify_signature("whsec_test", &tampered, &signature));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let body = Bytes::from_static(b"{}");
        let signature = sign("whsec_test", &body);
        assert!(!verify_signature("whsec_other", &body, &signature));
    }

    #[test]
    fn constant_time_eq_handles_length_mismatch() {
        assert!(!constant_time_eq("abc", "abcd"));
        assert!(constant_time_eq("abc", "abc"));
    }
}
