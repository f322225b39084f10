use crate::handlers::common::{created_response, success_response, validate_input};
use crate::{
    entities::{order::OrderStatus, payment::PaymentMethod},
    errors::ServiceError,
    services::orders::{CreateOrderInput, OrderLineInput},
    AppState,
};
use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

/// Creates the router for order endpoints
pub fn orders_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(create_order))
        .route("/:id", get(get_order))
        .route("/:id/ship", post(ship_order))
        .route("/:id/deliver", post(deliver_order))
        .route("/:id/cancel", post(cancel_order))
}

#[derive(Debug, Deserialize, Validate)]
struct CreateOrderRequest {
    user_id: Uuid,
    /// Explicit lines. When absent the caller's cart is checked out instead.
    items: Option<Vec<OrderLineInput>>,
    #[validate(length(min = 1, message = "Shipping address is required"))]
    shipping_address: String,
    payment_method: PaymentMethod,
    transaction_id: Option<String>,
}

/// Place an order, either from explicit lines or from the user's cart
async fn create_order(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateOrderRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;

    let (items, cart_id) = match payload.items {
        Some(items) => (items, None),
        None => {
            let resolved = state
                .services
                .carts
                .resolve(Some(payload.user_id), None)
                .await?;
            let items = resolved
                .items
                .iter()
                .map(|item| OrderLineInput {
                    product_id: item.product_id,
                    quantity: item.quantity,
                })
                .collect();
            (items, Some(resolved.cart.id))
        }
    };

    let placed = state
        .services
        .orders
        .create_order(CreateOrderInput {
            user_id: payload.user_id,
            items,
            shipping_address: payload.shipping_address,
            payment_method: payload.payment_method,
            transaction_id: payload.transaction_id,
        })
        .await?;

    // Checkout consumed the cart lines; the cart row itself stays.
    if let Some(cart_id) = cart_id {
        if placed.order.status != OrderStatus::Cancelled {
            state.services.carts.clear(cart_id).await?;
        }
    }

    Ok(created_response(placed))
}

/// Get an order with its items and payment
async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let details = state.services.orders.get_order(id).await?;
    Ok(success_response(details))
}

/// Mark an order as shipped
async fn ship_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state.services.order_status.ship_order(id).await?;
    Ok(success_response(order))
}

/// Mark an order as delivered
async fn deliver_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state.services.order_status.deliver_order(id).await?;
    Ok(success_response(order))
}

/// Cancel an order and restore its stock
async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state.services.order_status.cancel_order(id).await?;
    Ok(success_response(order))
}
